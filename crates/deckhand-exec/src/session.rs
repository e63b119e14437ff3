//! Exec session and its read pump
//!
//! [`ExecSession::open`] returns two halves:
//! - [`ExecSession`]: a cheap, cloneable handle used by request handlers to
//!   send input, read history and stop the session
//! - [`SessionPump`]: the sole owner of the channel, run on its own task
//!
//! The pump is the only code that touches the channel. It polls with a short
//! timeout, appends every chunk to the shared history in read order, and
//! closes the channel exactly once when it exits. How it exited is returned
//! as a [`SessionEnd`] value rather than an error.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use deckhand_common::{ExecConfig, Result};

use crate::transport::{ExecChannel, ExecTarget, ExecTransport, OutputChunk};

/// Unique session identifier
pub type SessionId = Uuid;

/// Lifecycle of a session; `Closed` is terminal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Channel open, pump not started yet
    Created,
    /// Pump is running
    Running,
    /// Pump exited and the channel is closed
    Closed,
}

/// Why the pump loop exited
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// `stop()` was called, or every session handle was dropped
    Stopped,
    /// The remote end closed the channel
    ChannelClosed,
    /// Reading or writing the channel failed
    TransportFailed(String),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Stopped => write!(f, "stopped"),
            SessionEnd::ChannelClosed => write!(f, "channel closed"),
            SessionEnd::TransportFailed(reason) => write!(f, "transport failed: {reason}"),
        }
    }
}

enum PumpCommand {
    Stdin(Vec<u8>),
    Resize { width: u16, height: u16 },
}

/// Ordered output buffer with absolute sequence numbers.
///
/// `base` is the sequence number of the oldest retained chunk, so cursors
/// handed out earlier stay meaningful after old chunks are dropped.
#[derive(Debug)]
struct History {
    chunks: VecDeque<OutputChunk>,
    base: u64,
    limit: Option<usize>,
}

impl History {
    fn new(limit: Option<usize>) -> Self {
        Self {
            chunks: VecDeque::new(),
            base: 0,
            limit,
        }
    }

    fn push(&mut self, chunk: OutputChunk) {
        self.chunks.push_back(chunk);
        if let Some(limit) = self.limit {
            while self.chunks.len() > limit {
                self.chunks.pop_front();
                self.base += 1;
            }
        }
    }

    fn next_seq(&self) -> u64 {
        self.base + self.chunks.len() as u64
    }

    fn since(&self, cursor: u64) -> (Vec<OutputChunk>, u64) {
        let start = cursor.max(self.base);
        let skip = usize::try_from(start - self.base).unwrap_or(usize::MAX);
        let chunks = self.chunks.iter().skip(skip).cloned().collect();
        (chunks, self.next_seq().max(cursor))
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
    closed_at: Option<Instant>,
}

#[derive(Debug)]
struct Shared {
    id: SessionId,
    target: ExecTarget,
    running: AtomicBool,
    channel_open: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    history: Mutex<History>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == SessionState::Closed {
            return;
        }
        lifecycle.state = state;
        if state == SessionState::Closed {
            lifecycle.closed_at = Some(Instant::now());
        }
    }
}

/// Handle to one interactive session
#[derive(Clone)]
pub struct ExecSession {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<PumpCommand>,
}

impl ExecSession {
    /// Open a channel to `target` and build the session halves.
    ///
    /// Failure to open is returned to the caller and not retried. The
    /// returned pump must be driven (see [`SessionPump::run`]) for output to
    /// be collected.
    pub async fn open(
        transport: &dyn ExecTransport,
        target: ExecTarget,
        config: &ExecConfig,
    ) -> Result<(ExecSession, SessionPump)> {
        let channel = transport.open(&target, config).await?;
        Ok(Self::from_channel(channel, target, config))
    }

    /// Open a session and run its pump on a new task
    pub async fn spawn(
        transport: &dyn ExecTransport,
        target: ExecTarget,
        config: &ExecConfig,
    ) -> Result<(ExecSession, JoinHandle<SessionEnd>)> {
        let (session, pump) = Self::open(transport, target, config).await?;
        Ok((session, tokio::spawn(pump.run())))
    }

    /// Build session halves around an already-open channel
    pub fn from_channel(
        channel: Box<dyn ExecChannel>,
        target: ExecTarget,
        config: &ExecConfig,
    ) -> (ExecSession, SessionPump) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            target,
            running: AtomicBool::new(true),
            channel_open: AtomicBool::new(channel.is_open()),
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Created,
                closed_at: None,
            }),
            history: Mutex::new(History::new(config.history_limit)),
        });

        info!(session = %shared.id, exec_target = %shared.target, "Exec session opened");

        let pump = SessionPump {
            shared: shared.clone(),
            channel,
            commands: commands_rx,
            poll_interval: config.poll_interval(),
        };
        let session = ExecSession {
            shared,
            commands: commands_tx,
        };
        (session, pump)
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Remote endpoint
    pub fn target(&self) -> &ExecTarget {
        &self.shared.target
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.shared.lifecycle.lock().state
    }

    /// When the session reached `Closed`
    pub fn closed_at(&self) -> Option<Instant> {
        self.shared.lifecycle.lock().closed_at
    }

    /// Whether the session has not been stopped and has not closed
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst) && self.state() != SessionState::Closed
    }

    /// Queue bytes for the remote stdin.
    ///
    /// Silently dropped when the channel is no longer open.
    pub fn send_input(&self, data: impl Into<Vec<u8>>) {
        if !self.accepts_commands() {
            debug!(session = %self.shared.id, "Dropping input for closed session");
            return;
        }
        if self.commands.send(PumpCommand::Stdin(data.into())).is_err() {
            debug!(session = %self.shared.id, "Dropping input, pump has exited");
        }
    }

    /// Queue a terminal resize; dropped when the channel is no longer open
    pub fn resize(&self, width: u16, height: u16) {
        if self.accepts_commands() {
            let _ = self.commands.send(PumpCommand::Resize { width, height });
        }
    }

    /// Ask the pump to exit.
    ///
    /// Returns immediately; the pump notices within one poll interval and
    /// closes the channel itself.
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            info!(session = %self.shared.id, "Exec session stop requested");
        }
    }

    /// Every retained chunk, in read order
    pub fn history(&self) -> Vec<OutputChunk> {
        self.shared.history.lock().chunks.iter().cloned().collect()
    }

    /// Chunks at or after `cursor`, plus the cursor to pass next time.
    ///
    /// Chunks dropped by the history limit are skipped.
    pub fn history_since(&self, cursor: u64) -> (Vec<OutputChunk>, u64) {
        self.shared.history.lock().since(cursor)
    }

    fn accepts_commands(&self) -> bool {
        self.shared.channel_open.load(Ordering::SeqCst) && self.state() != SessionState::Closed
    }
}

impl fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecSession")
            .field("id", &self.shared.id)
            .field("target", &self.shared.target)
            .field("state", &self.state())
            .finish()
    }
}

/// Owner of the session's channel; drives output into history
pub struct SessionPump {
    shared: Arc<Shared>,
    channel: Box<dyn ExecChannel>,
    commands: mpsc::UnboundedReceiver<PumpCommand>,
    poll_interval: Duration,
}

impl SessionPump {
    /// Run until stopped, until the channel closes, or until the transport
    /// fails. Never returns an error; the exit reason is the return value.
    #[instrument(skip(self), fields(session = %self.shared.id))]
    pub async fn run(mut self) -> SessionEnd {
        self.shared.set_state(SessionState::Running);

        let end = loop {
            if !self.shared.running.load(Ordering::SeqCst) {
                break SessionEnd::Stopped;
            }
            if !self.channel.is_open() {
                break SessionEnd::ChannelClosed;
            }

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.apply(command).await {
                            break SessionEnd::TransportFailed(e);
                        }
                    }
                    None => break SessionEnd::Stopped,
                },

                polled = self.channel.poll(self.poll_interval) => match polled {
                    Ok(Some(chunk)) => {
                        self.shared.history.lock().push(chunk);
                    }
                    Ok(None) => {}
                    Err(e) => break SessionEnd::TransportFailed(e.to_string()),
                },
            }
        };

        self.channel.close().await;
        self.shared.channel_open.store(false, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.set_state(SessionState::Closed);

        match &end {
            SessionEnd::TransportFailed(reason) => {
                warn!(reason = %reason, "Exec session ended by transport failure")
            }
            other => info!(end = %other, "Exec session ended"),
        }
        end
    }

    async fn apply(&mut self, command: PumpCommand) -> std::result::Result<(), String> {
        if !self.channel.is_open() {
            return Ok(());
        }
        match command {
            PumpCommand::Stdin(data) => self
                .channel
                .write_stdin(&data)
                .await
                .map_err(|e| e.to_string()),
            PumpCommand::Resize { width, height } => {
                // A lost resize only leaves the terminal at its old size
                if let Err(e) = self.channel.resize(width, height).await {
                    debug!(error = %e, "Terminal resize failed");
                }
                Ok(())
            }
        }
    }
}
