//! Error types for deckhand
//!
//! Errors are grouped by how callers must react to them:
//! - `Connectivity` failures are the only ones the connectivity gate caches
//!   on behalf of one-off operations
//! - `Api` errors mean the cluster answered; they are never cached by
//!   one-off operations
//! - `NotFound` and `InvalidRequest` are surfaced immediately and never cached
//! - `TransportClosed` marks a finished exec session and is never escalated

use std::fmt;

use thiserror::Error;

use crate::kube_utils::is_timeout_or_unreachable;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// How a connectivity failure is classified.
///
/// The class decides how long the gate keeps the failure cached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Network timeout or unreachable host
    Timeout,
    /// Any other failure
    Transient,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Timeout => write!(f, "timeout"),
            FailureClass::Transient => write!(f, "transient"),
        }
    }
}

/// Main error type for deckhand operations
#[derive(Debug, Error)]
pub enum Error {
    /// The cluster could not be reached or answered with a failure
    #[error("cluster {cluster} unreachable ({class}): {message}")]
    Connectivity {
        /// Cluster key the call was issued against
        cluster: String,
        /// Timeout vs transient classification
        class: FailureClass,
        /// Description of what failed
        message: String,
    },

    /// The API server answered with an error status (other than 404)
    #[error("cluster {cluster} rejected request: {message} ({code})")]
    Api {
        /// Cluster key the call was issued against
        cluster: String,
        /// HTTP status code
        code: u16,
        /// Status message from the API server
        message: String,
    },

    /// The requested resource does not exist
    #[error("{kind} {name} not found{}", namespace.as_deref().map(|ns| format!(" in namespace {ns}")).unwrap_or_default())]
    NotFound {
        /// Resource kind (e.g., "pod")
        kind: String,
        /// Namespace, if the kind is namespaced
        namespace: Option<String>,
        /// Resource name
        name: String,
    },

    /// An exec session channel has ended
    #[error("exec session {session} transport closed")]
    TransportClosed {
        /// Session identifier
        session: String,
    },

    /// The caller asked for something that can never succeed
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Description of what's invalid
        message: String,
    },

    /// An exec channel could not be established
    #[error("failed to open exec channel to {target}: {message}")]
    Connection {
        /// Target endpoint (namespace/pod)
        target: String,
        /// Description of what failed
        message: String,
    },

    /// Configuration could not be loaded or is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's wrong
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "fetcher", "pump")
        context: String,
    },
}

impl Error {
    /// Create a connectivity error with an explicit class
    pub fn connectivity(
        cluster: impl Into<String>,
        class: FailureClass,
        msg: impl Into<String>,
    ) -> Self {
        Self::Connectivity {
            cluster: cluster.into(),
            class,
            message: msg.into(),
        }
    }

    /// Create a connectivity error for a call that exceeded its deadline
    pub fn deadline_exceeded(cluster: impl Into<String>, operation: &str) -> Self {
        Self::Connectivity {
            cluster: cluster.into(),
            class: FailureClass::Timeout,
            message: format!("{} timed out", operation),
        }
    }

    /// Create an API status error
    pub fn api(cluster: impl Into<String>, code: u16, msg: impl Into<String>) -> Self {
        Self::Api {
            cluster: cluster.into(),
            code,
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Create a transport-closed error for a session
    pub fn transport_closed(session: impl fmt::Display) -> Self {
        Self::TransportClosed {
            session: session.to_string(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: msg.into(),
        }
    }

    /// Create an exec connection error
    pub fn connection(target: impl fmt::Display, msg: impl Into<String>) -> Self {
        Self::Connection {
            target: target.to_string(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Convert a kube-rs error raised while talking to `cluster`.
    ///
    /// - API 404 becomes `NotFound` for the given kind/name
    /// - any other API status becomes `Api`: the cluster is reachable
    /// - transport-level failures are classified by [`is_timeout_or_unreachable`]
    pub fn from_kube(
        cluster: &str,
        kind: &str,
        namespace: Option<&str>,
        name: Option<&str>,
        err: kube::Error,
    ) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => {
                Self::not_found(kind, namespace, name.unwrap_or(UNKNOWN_CONTEXT))
            }
            kube::Error::Api(ae) => Self::api(cluster, ae.code, ae.message.clone()),
            _ => {
                let class = if is_timeout_or_unreachable(&err) {
                    FailureClass::Timeout
                } else {
                    FailureClass::Transient
                };
                Self::connectivity(cluster, class, err.to_string())
            }
        }
    }

    /// Failure class used when this error is reported to the gate.
    ///
    /// Only connectivity errors carry their own class; every other error
    /// counts as transient.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Error::Connectivity { class, .. } => *class,
            _ => FailureClass::Transient,
        }
    }

    /// Whether the gate may cache this error as a connectivity verdict.
    ///
    /// API status responses prove the cluster is reachable, so only
    /// transport-level connectivity failures qualify.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Error::Connectivity { .. })
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Connectivity { cluster, .. } | Error::Api { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
