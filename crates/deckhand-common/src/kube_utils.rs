//! Kubernetes client helpers
//!
//! Client construction with explicit connect/read timeouts, a per-call
//! deadline wrapper, and the failure classifier the connectivity gate uses
//! to decide how long a failure stays cached.

use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Returns true when `err` (or anything in its source chain) is a network
/// timeout or an unreachable-endpoint failure.
///
/// The predicate only inspects error types, never message text:
/// - `tokio::time::error::Elapsed` anywhere in the chain
/// - `std::io::Error` with a timeout/refused/unreachable kind, including io
///   errors that wrap another error carrying one of those kinds
pub fn is_timeout_or_unreachable(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<tokio::time::error::Elapsed>() {
            return true;
        }
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if is_unreachable_kind(io_err.kind()) {
                return true;
            }
            if let Some(inner) = io_err.get_ref() {
                if is_timeout_or_unreachable(inner) {
                    return true;
                }
            }
        }
        current = e.source();
    }
    false
}

fn is_unreachable_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::NotConnected
    )
}

/// Run a cluster call with a hard deadline.
///
/// A call still pending at the deadline is dropped and reported as a
/// timeout-class connectivity failure for `cluster`.
pub async fn with_deadline<T, F>(
    cluster: &str,
    operation: &str,
    deadline: Duration,
    call: F,
) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::deadline_exceeded(cluster, operation)),
    }
}

/// Create a kube client from optional kubeconfig path and context with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    context: Option<&str>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };

    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None if context.is_some() => Config::from_kubeconfig(&options).await.map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load kubeconfig context: {}", e),
            )
        })?,
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };

    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}
