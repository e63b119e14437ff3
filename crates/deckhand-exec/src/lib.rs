//! Interactive exec sessions for deckhand
//!
//! A session multiplexes a remote shell's stdin/stdout/stderr against a
//! request/response caller: a dedicated pump task reads the channel into an
//! ordered history, while callers send input and read history through a
//! cloneable handle.

#![deny(missing_docs)]

pub mod kube_transport;
pub mod registry;
pub mod session;
pub mod transport;

pub use kube_transport::{KubeExecChannel, KubeExecTransport};
pub use registry::SessionRegistry;
pub use session::{ExecSession, SessionEnd, SessionId, SessionPump, SessionState};
pub use transport::{ExecChannel, ExecTarget, ExecTransport, OutputChunk, StreamKind, TransportError};
