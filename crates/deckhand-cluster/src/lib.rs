//! Cluster-facing half of deckhand
//!
//! - [`gate`]: per-cluster connectivity gate (one live probe at a time,
//!   cached failure verdicts)
//! - [`api`]: bounded-deadline cluster API trait and its kube-rs implementation
//! - [`snapshot`]: canary-then-fan-out snapshot fetcher
//! - [`ops`]: gated single-shot operations (get, delete, scale, restart)

#![deny(missing_docs)]

pub mod api;
pub mod gate;
pub mod ops;
pub mod snapshot;

pub use api::{ClusterApi, KubeClusterApi, ResourceKind, SNAPSHOT_KINDS};
pub use gate::{CachedFailure, ConnectivityGate, GateDecision, GateRecord, ProbeState, ProbeStatus};
pub use ops::ClusterOps;
pub use snapshot::{Availability, KindResult, Snapshot, SnapshotFetcher};
