//! Shared building blocks for deckhand: errors, the TTL cache store,
//! kube client helpers, configuration and telemetry.

#![deny(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod kube_utils;
pub mod telemetry;

pub use cache::{CacheStore, MemoryCacheStore};
pub use config::{ClusterConfig, DeckhandConfig, ExecConfig, FetchConfig, GateConfig};
pub use error::{Error, FailureClass};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
