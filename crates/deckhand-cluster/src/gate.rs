//! Connectivity gate
//!
//! Keeps concurrent callers from independently retrying a slow or dead
//! cluster. For each cluster key the gate allows at most one live probe in
//! flight; everyone else either reuses the cached failure verdict or is told
//! a probe is already running.
//!
//! State lives in an injected [`CacheStore`] under two keys per cluster:
//! - `<key>/probe` holds the `Probing` marker (set atomically with
//!   [`CacheStore::set_if_absent`], expires after the probe TTL so an
//!   abandoned probe releases the key on its own)
//! - `<key>/verdict` holds the last outcome (`Failed` or `Healthy`)
//!
//! Expiry is evaluated lazily whenever the store is read.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use deckhand_common::{CacheStore, Error, FailureClass, GateConfig, MemoryCacheStore};

/// Value stored in the gate's cache store
#[derive(Clone, Debug, PartialEq)]
pub enum GateRecord {
    /// A live probe is in flight until `deadline`
    Probing {
        /// When the marker stops blocking other callers
        deadline: Instant,
    },
    /// The last probe failed; reuse this verdict until `deadline`
    Failed {
        /// Failure description shown to callers
        message: String,
        /// Classification that picked the TTL
        class: FailureClass,
        /// When the cached failure expires
        deadline: Instant,
    },
    /// The last probe succeeded
    Healthy {
        /// When the healthy verdict stops being reported
        deadline: Instant,
    },
}

/// What a caller may do after asking the gate
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateDecision {
    /// Caller owns the probe and must report success or failure
    Proceed,
    /// A recent failure is cached; do not call the cluster
    ReuseCachedError {
        /// Cached failure description
        message: String,
        /// Time left until the cached failure expires
        retry_after: Duration,
    },
    /// Another caller is probing; report "in progress" without blocking
    ProbeInProgress,
}

/// Coarse gate status for one cluster key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeStatus {
    /// Nothing known; the next caller may probe
    Idle,
    /// A probe is in flight
    Probing,
    /// A failure is cached
    CachedError,
    /// The last probe succeeded recently
    Healthy,
}

/// Snapshot of the gate's view of one cluster key
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeState {
    /// Active status
    pub status: ProbeStatus,
    /// Cached failure message, present only for `CachedError`
    pub error_message: Option<String>,
    /// Cached failure class, present only for `CachedError`
    pub error_class: Option<FailureClass>,
    /// Probe marker expiry, present only for `Probing`
    pub probing_deadline: Option<Instant>,
    /// Cached failure expiry, present only for `CachedError`
    pub error_deadline: Option<Instant>,
}

impl ProbeState {
    fn idle() -> Self {
        Self {
            status: ProbeStatus::Idle,
            error_message: None,
            error_class: None,
            probing_deadline: None,
            error_deadline: None,
        }
    }
}

/// A cached failure verdict
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedFailure {
    /// Failure description
    pub message: String,
    /// Failure classification
    pub class: FailureClass,
    /// Time left until the verdict expires
    pub retry_after: Duration,
}

/// Per-cluster circuit breaker over a shared cache store
#[derive(Clone)]
pub struct ConnectivityGate {
    store: Arc<dyn CacheStore<GateRecord>>,
    config: GateConfig,
}

fn probe_key(key: &str) -> String {
    format!("{key}/probe")
}

fn verdict_key(key: &str) -> String {
    format!("{key}/verdict")
}

impl ConnectivityGate {
    /// Create a gate over an injected store.
    ///
    /// The store's `set_if_absent` must be atomic; the gate's
    /// one-probe-per-key guarantee is only as strong as that operation.
    pub fn new(store: Arc<dyn CacheStore<GateRecord>>, config: GateConfig) -> Self {
        Self { store, config }
    }

    /// Create a gate backed by a process-local [`MemoryCacheStore`]
    pub fn in_memory(config: GateConfig) -> Self {
        Self::new(Arc::new(MemoryCacheStore::<GateRecord>::new()), config)
    }

    /// Gate configuration
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Decide whether the caller may issue a live call against `key`.
    ///
    /// On [`GateDecision::Proceed`] the caller owns the probe and must call
    /// [`report_success`](Self::report_success) or
    /// [`report_failure`](Self::report_failure); if it never does, the
    /// marker expires after the probe TTL.
    pub fn check_and_enter(&self, key: &str) -> GateDecision {
        if let Some(cached) = self.cached_error(key) {
            return reuse(key, cached);
        }

        let ttl = self.config.probe_ttl();
        let marker = GateRecord::Probing {
            deadline: Instant::now() + ttl,
        };
        if !self.store.set_if_absent(&probe_key(key), marker, ttl) {
            debug!(cluster = %key, "Connectivity probe already in progress");
            return GateDecision::ProbeInProgress;
        }

        // A prober may have cached its failure and released the marker
        // between the read above and our insert.
        if let Some(cached) = self.cached_error(key) {
            self.store.delete(&probe_key(key));
            return reuse(key, cached);
        }

        debug!(cluster = %key, "Entering connectivity probe");
        GateDecision::Proceed
    }

    /// Record a successful probe: clears the probe marker and any cached failure
    pub fn report_success(&self, key: &str) {
        let ttl = self.config.healthy_ttl();
        // Verdict first, then release the marker, so a concurrent caller never
        // sees a window with neither and starts a second probe.
        self.store.set_with_ttl(
            &verdict_key(key),
            GateRecord::Healthy {
                deadline: Instant::now() + ttl,
            },
            ttl,
        );
        self.store.delete(&probe_key(key));
        debug!(cluster = %key, "Connectivity probe succeeded");
    }

    /// Record a failed probe: clears the probe marker and caches the failure
    /// for the TTL matching its class.
    pub fn report_failure(&self, key: &str, error: &Error) {
        self.cache_failure(key, error);
        self.store.delete(&probe_key(key));
    }

    /// Cache a failure verdict without touching the probe marker.
    ///
    /// Used by one-off operations that observed a connectivity failure
    /// without owning the probe.
    pub fn cache_failure(&self, key: &str, error: &Error) {
        let class = error.failure_class();
        let ttl = self.error_ttl(class);
        let message = match error {
            Error::Connectivity { message, .. } => message.clone(),
            other => other.to_string(),
        };
        warn!(
            cluster = %key,
            class = %class,
            ttl_secs = ttl.as_secs(),
            error = %message,
            "Caching connectivity failure"
        );
        self.store.set_with_ttl(
            &verdict_key(key),
            GateRecord::Failed {
                message,
                class,
                deadline: Instant::now() + ttl,
            },
            ttl,
        );
    }

    /// Drop every piece of state held for `key`
    pub fn reset(&self, key: &str) {
        self.store.delete(&probe_key(key));
        self.store.delete(&verdict_key(key));
        info!(cluster = %key, "Connectivity gate reset");
    }

    /// Cache lifetime for a failure of the given class
    pub fn error_ttl(&self, class: FailureClass) -> Duration {
        match class {
            FailureClass::Timeout => self.config.timeout_error_ttl(),
            FailureClass::Transient => self.config.transient_error_ttl(),
        }
    }

    /// The unexpired cached failure for `key`, if any
    pub fn cached_error(&self, key: &str) -> Option<CachedFailure> {
        match self.store.get(&verdict_key(key)) {
            Some(GateRecord::Failed {
                message,
                class,
                deadline,
            }) => Some(CachedFailure {
                message,
                class,
                retry_after: deadline.saturating_duration_since(Instant::now()),
            }),
            _ => None,
        }
    }

    /// Current state for `key`.
    ///
    /// At most one status is reported; a cached failure outranks an
    /// in-flight probe, which outranks a healthy verdict.
    pub fn state(&self, key: &str) -> ProbeState {
        let verdict = self.store.get(&verdict_key(key));
        if let Some(GateRecord::Failed {
            message,
            class,
            deadline,
        }) = verdict
        {
            return ProbeState {
                status: ProbeStatus::CachedError,
                error_message: Some(message),
                error_class: Some(class),
                probing_deadline: None,
                error_deadline: Some(deadline),
            };
        }

        if let Some(GateRecord::Probing { deadline }) = self.store.get(&probe_key(key)) {
            return ProbeState {
                status: ProbeStatus::Probing,
                probing_deadline: Some(deadline),
                ..ProbeState::idle()
            };
        }

        match verdict {
            Some(GateRecord::Healthy { .. }) => ProbeState {
                status: ProbeStatus::Healthy,
                ..ProbeState::idle()
            },
            _ => ProbeState::idle(),
        }
    }
}

fn reuse(key: &str, cached: CachedFailure) -> GateDecision {
    debug!(
        cluster = %key,
        retry_after_secs = cached.retry_after.as_secs(),
        "Reusing cached connectivity failure"
    );
    GateDecision::ReuseCachedError {
        message: cached.message,
        retry_after: cached.retry_after,
    }
}

impl std::fmt::Debug for ConnectivityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityGate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
