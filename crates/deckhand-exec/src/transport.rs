//! Exec transport abstraction
//!
//! The session bridge only sees these traits; [`crate::kube_transport`]
//! provides the kube-rs implementation and tests use scripted channels.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use deckhand_common::{ExecConfig, Result};

/// Remote endpoint of an exec session
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExecTarget {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container name; the pod's default container when unset
    pub container: Option<String>,
}

impl ExecTarget {
    /// Target the default container of a pod
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: None,
        }
    }

    /// Target a specific container
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }
}

impl fmt::Display for ExecTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod)?;
        if let Some(container) = &self.container {
            write!(f, ":{container}")?;
        }
        Ok(())
    }
}

/// Which remote stream a chunk was read from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// One read from the remote process
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputChunk {
    /// Source stream
    pub stream: StreamKind,
    /// Raw bytes as read
    pub data: Vec<u8>,
}

impl OutputChunk {
    /// Chunk read from stdout
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: StreamKind::Stdout,
            data: data.into(),
        }
    }

    /// Chunk read from stderr
    pub fn stderr(data: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: StreamKind::Stderr,
            data: data.into(),
        }
    }
}

/// Failure on an established channel
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel was closed underneath the caller
    #[error("channel closed")]
    Closed,

    /// Reading or writing the underlying stream failed
    #[error("stream error: {0}")]
    Io(String),
}

/// Opens exec channels
#[async_trait]
pub trait ExecTransport: Send + Sync {
    /// Establish an interactive channel to `target`.
    ///
    /// Fails with `Error::Connection` when the channel cannot be set up.
    async fn open(&self, target: &ExecTarget, config: &ExecConfig) -> Result<Box<dyn ExecChannel>>;
}

/// A live bidirectional channel to a remote process
#[async_trait]
pub trait ExecChannel: Send {
    /// Whether the remote end is still producing or accepting data
    fn is_open(&self) -> bool;

    /// Wait up to `timeout` for the next output chunk.
    ///
    /// `Ok(None)` means nothing arrived in time or the channel just ended
    /// (check [`is_open`](Self::is_open)). Must be cancel-safe: dropping the
    /// future before it resolves loses no data.
    async fn poll(&mut self, timeout: Duration) -> std::result::Result<Option<OutputChunk>, TransportError>;

    /// Write bytes to the remote stdin
    async fn write_stdin(&mut self, data: &[u8]) -> std::result::Result<(), TransportError>;

    /// Propagate a terminal size change
    async fn resize(&mut self, _width: u16, _height: u16) -> std::result::Result<(), TransportError> {
        Ok(())
    }

    /// Close the channel; closing twice is a no-op
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_display() {
        let target = ExecTarget::new("default", "web-0");
        assert_eq!(target.to_string(), "default/web-0");
        assert_eq!(
            target.with_container("sidecar").to_string(),
            "default/web-0:sidecar"
        );
    }

    #[test]
    fn test_chunk_constructors_tag_stream() {
        assert_eq!(OutputChunk::stdout("a").stream, StreamKind::Stdout);
        assert_eq!(OutputChunk::stderr(b"b".to_vec()).data, b"b");
    }
}
