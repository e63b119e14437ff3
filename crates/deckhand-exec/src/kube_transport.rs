//! Exec transport backed by kube-rs `AttachedProcess`
//!
//! Reader tasks forward stdout/stderr into one bounded queue so the session
//! pump sees a single ordered stream of chunks. The queue closing (all
//! reader tasks done) is how the channel learns the remote process exited.

use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, AttachedProcess, TerminalSize};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use deckhand_common::{Error, ExecConfig, Result};

use crate::transport::{ExecChannel, ExecTarget, ExecTransport, OutputChunk, StreamKind, TransportError};

const OUTPUT_QUEUE_DEPTH: usize = 64;
const READ_BUF_SIZE: usize = 4096;
const STATUS_WAIT: Duration = Duration::from_secs(1);

type ReaderItem = std::result::Result<OutputChunk, TransportError>;

/// Opens exec channels with the pods/exec subresource
#[derive(Clone)]
pub struct KubeExecTransport {
    client: Client,
}

impl KubeExecTransport {
    /// Create a transport over an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// With a TTY the remote end merges stderr into stdout, and the API server
/// rejects a request that asks for both.
fn attach_params(target: &ExecTarget, tty: bool) -> AttachParams {
    AttachParams {
        stdin: true,
        stdout: true,
        stderr: !tty,
        tty,
        container: target.container.clone(),
        max_stdin_buf_size: None,
        max_stdout_buf_size: None,
        max_stderr_buf_size: None,
    }
}

#[async_trait]
impl ExecTransport for KubeExecTransport {
    async fn open(&self, target: &ExecTarget, config: &ExecConfig) -> Result<Box<dyn ExecChannel>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let params = attach_params(target, config.tty);

        let attached = pods
            .exec(&target.pod, config.command.clone(), &params)
            .await
            .map_err(|e| Error::connection(target, format!("exec failed: {e}")))?;

        info!(exec_target = %target, tty = config.tty, "Exec channel established");
        Ok(Box::new(KubeExecChannel::new(attached, target.to_string())))
    }
}

/// [`ExecChannel`] over a kube-rs attached process
pub struct KubeExecChannel {
    target: String,
    attached: Option<AttachedProcess>,
    stdin_writer: Option<Box<dyn AsyncWrite + Unpin + Send>>,
    terminal_size_tx: Option<futures::channel::mpsc::Sender<TerminalSize>>,
    output_rx: mpsc::Receiver<ReaderItem>,
    reader_handles: Vec<JoinHandle<()>>,
    open: bool,
}

impl KubeExecChannel {
    /// Wrap an attached process; spawns one reader task per output stream
    pub fn new(mut attached: AttachedProcess, target: String) -> Self {
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
        let mut reader_handles = vec![];

        if let Some(stdout) = attached.stdout() {
            reader_handles.push(tokio::spawn(forward_reader(
                stdout,
                StreamKind::Stdout,
                output_tx.clone(),
                target.clone(),
            )));
        }
        if let Some(stderr) = attached.stderr() {
            reader_handles.push(tokio::spawn(forward_reader(
                stderr,
                StreamKind::Stderr,
                output_tx.clone(),
                target.clone(),
            )));
        }

        // Drop our copy so the queue closes when the reader tasks finish
        drop(output_tx);

        let stdin_writer = attached
            .stdin()
            .map(|w| Box::new(w) as Box<dyn AsyncWrite + Unpin + Send>);
        let terminal_size_tx = attached.terminal_size();

        Self {
            target,
            attached: Some(attached),
            stdin_writer,
            terminal_size_tx,
            output_rx,
            reader_handles,
            open: true,
        }
    }
}

#[async_trait]
impl ExecChannel for KubeExecChannel {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn poll(&mut self, timeout: Duration) -> std::result::Result<Option<OutputChunk>, TransportError> {
        if !self.open {
            return Ok(None);
        }
        match tokio::time::timeout(timeout, self.output_rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => {
                debug!(exec_target = %self.target, "All exec streams ended");
                self.open = false;
                Ok(None)
            }
        }
    }

    async fn write_stdin(&mut self, data: &[u8]) -> std::result::Result<(), TransportError> {
        let writer = self.stdin_writer.as_mut().ok_or(TransportError::Closed)?;
        writer
            .write_all(data)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn resize(&mut self, width: u16, height: u16) -> std::result::Result<(), TransportError> {
        if let Some(tx) = self.terminal_size_tx.as_mut() {
            SinkExt::send(tx, TerminalSize { width, height })
                .await
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        let Some(mut attached) = self.attached.take() else {
            return;
        };
        self.open = false;

        // Dropping stdin and the resize sender lets kube-rs close the websocket
        drop(self.stdin_writer.take());
        drop(self.terminal_size_tx.take());
        for handle in self.reader_handles.drain(..) {
            handle.abort();
        }

        if let Some(status) = attached.take_status() {
            match tokio::time::timeout(STATUS_WAIT, status).await {
                Ok(Some(status)) => {
                    debug!(exec_target = %self.target, status = ?status.status, "Exec process exited")
                }
                Ok(None) => debug!(exec_target = %self.target, "Exec ended without status"),
                Err(_) => debug!(exec_target = %self.target, "Timed out waiting for exec status"),
            }
        }
        attached.abort();
        info!(exec_target = %self.target, "Exec channel closed");
    }
}

impl Drop for KubeExecChannel {
    fn drop(&mut self) {
        for handle in &self.reader_handles {
            handle.abort();
        }
        if let Some(attached) = self.attached.take() {
            attached.abort();
        }
    }
}

/// Forward one output stream into the shared queue until EOF or error
async fn forward_reader<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: StreamKind,
    tx: mpsc::Sender<ReaderItem>,
    target: String,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    stream,
                    data: buf[..n].to_vec(),
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(exec_target = %target, ?stream, error = %e, "Reader error");
                let _ = tx.send(Err(TransportError::Io(e.to_string()))).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tty_requests_merged_output() {
        let params = attach_params(&ExecTarget::new("default", "web-0"), true);
        assert!(params.stdin && params.stdout && params.tty);
        assert!(!params.stderr);
        assert!(params.container.is_none());
    }

    #[test]
    fn test_non_tty_requests_separate_stderr() {
        let target = ExecTarget::new("default", "web-0").with_container("app");
        let params = attach_params(&target, false);
        assert!(params.stderr);
        assert!(!params.tty);
        assert_eq!(params.container.as_deref(), Some("app"));
    }

    #[tokio::test]
    async fn test_forward_reader_tags_chunks_and_stops_at_eof() {
        let (tx, mut rx) = mpsc::channel(8);
        let input: &[u8] = b"hello";
        forward_reader(input, StreamKind::Stderr, tx, "default/web-0".to_string()).await;

        assert_eq!(rx.recv().await, Some(Ok(OutputChunk::stderr("hello"))));
        // Sender dropped at EOF, so the queue is closed
        assert_eq!(rx.recv().await, None);
    }
}
