//! Registry of live and recently closed exec sessions
//!
//! Request handlers address sessions by id. Closed sessions stay registered
//! for the retention window so a terminal UI can fetch the final output, then
//! [`SessionRegistry::reap_closed`] drops them. Embedders either call it
//! themselves or run [`SessionRegistry::spawn_reaper`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use deckhand_common::{Error, ExecConfig, Result};

use crate::session::{ExecSession, SessionEnd, SessionId, SessionState};
use crate::transport::{ExecTarget, ExecTransport, OutputChunk};

struct SessionEntry {
    session: ExecSession,
    pump: JoinHandle<SessionEnd>,
}

/// Tracks exec sessions by id
pub struct SessionRegistry {
    transport: Arc<dyn ExecTransport>,
    config: ExecConfig,
    sessions: DashMap<SessionId, SessionEntry>,
}

impl SessionRegistry {
    /// Create an empty registry opening sessions through `transport`
    pub fn new(transport: Arc<dyn ExecTransport>, config: ExecConfig) -> Self {
        Self {
            transport,
            config,
            sessions: DashMap::new(),
        }
    }

    /// Open a session to `target` and start its pump
    pub async fn open(&self, target: ExecTarget) -> Result<ExecSession> {
        let (session, pump) =
            ExecSession::spawn(self.transport.as_ref(), target, &self.config).await?;
        self.sessions.insert(
            session.id(),
            SessionEntry {
                session: session.clone(),
                pump,
            },
        );
        debug!(session = %session.id(), active = self.sessions.len(), "Registered exec session");
        Ok(session)
    }

    /// Handle for a registered session
    pub fn get(&self, id: &SessionId) -> Option<ExecSession> {
        self.sessions.get(id).map(|entry| entry.session.clone())
    }

    /// Send input to a session; input to a closed session is dropped
    pub fn send_input(&self, id: &SessionId, data: impl Into<Vec<u8>>) -> Result<()> {
        self.lookup(id)?.send_input(data);
        Ok(())
    }

    /// Propagate a terminal resize
    pub fn resize(&self, id: &SessionId, width: u16, height: u16) -> Result<()> {
        self.lookup(id)?.resize(width, height);
        Ok(())
    }

    /// Ask a session to stop; returns false for unknown ids
    pub fn stop(&self, id: &SessionId) -> bool {
        match self.sessions.get(id) {
            Some(entry) => {
                entry.session.stop();
                true
            }
            None => {
                warn!(session = %id, "Stop for unknown exec session");
                false
            }
        }
    }

    /// Ask every session to stop
    pub fn stop_all(&self) {
        let count = self.sessions.len();
        if count > 0 {
            info!(count, "Stopping all exec sessions");
            for entry in self.sessions.iter() {
                entry.session.stop();
            }
        }
    }

    /// Output chunks at or after `cursor`, plus the next cursor
    pub fn history_since(&self, id: &SessionId, cursor: u64) -> Result<(Vec<OutputChunk>, u64)> {
        Ok(self.lookup(id)?.history_since(cursor))
    }

    /// Drop sessions that have been closed for longer than the retention window.
    ///
    /// Returns how many sessions were removed.
    pub fn reap_closed(&self) -> usize {
        self.reap_closed_older_than(self.config.retention())
    }

    /// Run [`reap_closed`](Self::reap_closed) every `interval` until `token`
    /// is cancelled
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let reaped = registry.reap_closed();
                if reaped > 0 {
                    debug!(reaped, remaining = registry.len(), "Reaped closed exec sessions");
                }
            }
            debug!("Exec session reaper stopped");
        })
    }

    fn reap_closed_older_than(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|id, entry| {
            let expired = entry.session.state() == SessionState::Closed
                && entry
                    .session
                    .closed_at()
                    .is_some_and(|closed| now.duration_since(closed) >= retention);
            if expired {
                debug!(session = %id, finished = entry.pump.is_finished(), "Reaping exec session");
            }
            !expired
        });
        before - self.sessions.len()
    }

    /// Number of registered sessions, closed ones included
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are registered
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn lookup(&self, id: &SessionId) -> Result<ExecSession> {
        self.get(id)
            .ok_or_else(|| Error::not_found("exec session", None, id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ExecChannel, TransportError};
    use async_trait::async_trait;

    /// Channel that echoes stdin back as stdout until closed
    struct EchoChannel {
        pending: Vec<Vec<u8>>,
        open: bool,
    }

    #[async_trait]
    impl ExecChannel for EchoChannel {
        fn is_open(&self) -> bool {
            self.open
        }

        async fn poll(
            &mut self,
            timeout: Duration,
        ) -> std::result::Result<Option<OutputChunk>, TransportError> {
            if self.pending.is_empty() {
                tokio::time::sleep(timeout).await;
                return Ok(None);
            }
            let data = self.pending.remove(0);
            if data == b"exit\n" {
                self.open = false;
                return Ok(None);
            }
            Ok(Some(OutputChunk::stdout(data)))
        }

        async fn write_stdin(&mut self, data: &[u8]) -> std::result::Result<(), TransportError> {
            self.pending.push(data.to_vec());
            Ok(())
        }

        async fn close(&mut self) {
            self.open = false;
        }
    }

    struct EchoTransport;

    #[async_trait]
    impl ExecTransport for EchoTransport {
        async fn open(&self, target: &ExecTarget, _config: &ExecConfig) -> Result<Box<dyn ExecChannel>> {
            if target.pod == "missing" {
                return Err(Error::connection(target, "pod not found"));
            }
            Ok(Box::new(EchoChannel {
                pending: Vec::new(),
                open: true,
            }))
        }
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(EchoTransport), ExecConfig::default())
    }

    async fn wait_closed(session: &ExecSession) {
        while session.state() != SessionState::Closed {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Story: a user types into a shell and reads back the output incrementally
    #[tokio::test(start_paused = true)]
    async fn story_input_round_trips_through_registry() {
        let registry = registry();
        let session = registry.open(ExecTarget::new("default", "web-0")).await.unwrap();
        let id = session.id();

        registry.send_input(&id, "pwd\n").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let (chunks, cursor) = registry.history_since(&id, 0).unwrap();
        assert_eq!(chunks, vec![OutputChunk::stdout("pwd\n")]);

        registry.send_input(&id, "ls\n").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let (chunks, _) = registry.history_since(&id, cursor).unwrap();
        assert_eq!(chunks, vec![OutputChunk::stdout("ls\n")]);

        assert!(registry.stop(&id));
        wait_closed(&session).await;
    }

    #[tokio::test]
    async fn test_open_failure_registers_nothing() {
        let registry = registry();
        let err = registry
            .open(ExecTarget::new("default", "missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let registry = registry();
        let id = SessionId::new_v4();
        assert!(matches!(
            registry.send_input(&id, "x"),
            Err(Error::NotFound { .. })
        ));
        assert!(registry.history_since(&id, 0).is_err());
        assert!(!registry.stop(&id));
    }

    /// Story: closed sessions linger for the retention window, then go away
    #[tokio::test(start_paused = true)]
    async fn story_closed_sessions_are_reaped_after_retention() {
        let registry = registry();
        let done = registry.open(ExecTarget::new("default", "web-0")).await.unwrap();
        let live = registry.open(ExecTarget::new("default", "web-1")).await.unwrap();

        registry.send_input(&done.id(), "exit\n").unwrap();
        wait_closed(&done).await;

        // Final output can still be read, and input is silently dropped
        assert!(registry.history_since(&done.id(), 0).is_ok());
        assert!(registry.send_input(&done.id(), "again\n").is_ok());
        assert_eq!(registry.reap_closed(), 0);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(registry.reap_closed(), 1);
        assert!(registry.get(&done.id()).is_none());
        assert!(registry.get(&live.id()).is_some());

        registry.stop_all();
        wait_closed(&live).await;
    }

    /// Story: the background reaper clears closed sessions without the
    /// embedder calling reap_closed
    #[tokio::test(start_paused = true)]
    async fn story_reaper_task_drops_expired_sessions() {
        let registry = Arc::new(registry());
        let session = registry.open(ExecTarget::new("default", "web-0")).await.unwrap();
        registry.send_input(&session.id(), "exit\n").unwrap();
        wait_closed(&session).await;

        let token = CancellationToken::new();
        let reaper = registry.spawn_reaper(Duration::from_secs(10), token.clone());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(registry.len(), 1);

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(registry.is_empty());

        token.cancel();
        reaper.await.unwrap();
    }
}
