//! Resource snapshot fetcher
//!
//! Two phases, both gated:
//! 1. Canary: list namespaces. Failure here means the cluster is unreachable;
//!    it is reported to the gate and nothing else is fetched.
//! 2. Fan-out: list every other kind concurrently. Connectivity is already
//!    established, so per-kind errors are attached to that kind and never
//!    reach the gate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kube::api::DynamicObject;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use deckhand_common::{Error, Result};

use crate::api::{ClusterApi, ResourceKind, SNAPSHOT_KINDS};
use crate::gate::{ConnectivityGate, GateDecision};

/// Whether the snapshot reflects live data
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum Availability {
    /// The canary succeeded
    Available,
    /// The cluster is temporarily unavailable
    #[serde(rename_all = "camelCase")]
    Unavailable {
        /// Cached or fresh failure text
        reason: String,
        /// When a new attempt will be allowed, if known
        retry_after: Option<Duration>,
    },
    /// Another caller is checking connectivity right now
    Checking,
}

/// Result of listing one kind
#[derive(Clone, Debug, Default, Serialize)]
pub struct KindResult {
    /// Listed objects; empty on error
    pub items: Vec<DynamicObject>,
    /// Error text if the list call failed
    pub error: Option<String>,
}

/// Aggregate view of one cluster
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Cluster key
    pub cluster: String,
    /// Namespace the namespaced kinds were scoped to
    pub namespace_filter: Option<String>,
    /// Gate-derived availability
    pub availability: Availability,
    /// Namespace names from the canary call
    pub namespaces: Vec<String>,
    /// Per-kind results; every snapshot kind is present once the canary succeeds
    pub kinds: BTreeMap<ResourceKind, KindResult>,
}

impl Snapshot {
    fn degraded(cluster: &str, namespace_filter: Option<String>, availability: Availability) -> Self {
        Self {
            cluster: cluster.to_string(),
            namespace_filter,
            availability,
            namespaces: Vec::new(),
            kinds: BTreeMap::new(),
        }
    }

    /// Whether the snapshot carries live data
    pub fn is_available(&self) -> bool {
        self.availability == Availability::Available
    }

    /// Per-kind errors, in kind order
    pub fn errors(&self) -> Vec<(ResourceKind, &str)> {
        self.kinds
            .iter()
            .filter_map(|(kind, result)| result.error.as_deref().map(|e| (*kind, e)))
            .collect()
    }

    /// Items listed for `kind`; empty when the kind failed or was not fetched
    pub fn items(&self, kind: ResourceKind) -> &[DynamicObject] {
        self.kinds
            .get(&kind)
            .map(|r| r.items.as_slice())
            .unwrap_or_default()
    }
}

/// Fetches gated snapshots of one cluster
#[derive(Clone)]
pub struct SnapshotFetcher {
    api: Arc<dyn ClusterApi>,
    gate: ConnectivityGate,
    deadline: Duration,
}

impl SnapshotFetcher {
    /// Create a fetcher; `deadline` bounds every individual call
    pub fn new(api: Arc<dyn ClusterApi>, gate: ConnectivityGate, deadline: Duration) -> Self {
        Self {
            api,
            gate,
            deadline,
        }
    }

    /// Take a snapshot of `cluster`, optionally scoped to one namespace.
    ///
    /// Connectivity problems never surface as `Err`; they come back as a
    /// degraded snapshot. `Err` is returned only for a malformed filter.
    #[instrument(skip(self), fields(cluster = %cluster))]
    pub async fn fetch_snapshot(
        &self,
        cluster: &str,
        namespace_filter: Option<&str>,
    ) -> Result<Snapshot> {
        let namespace_filter = namespace_filter.filter(|ns| !ns.is_empty());
        if let Some(ns) = namespace_filter {
            validate_namespace(ns)?;
        }
        let filter = namespace_filter.map(str::to_string);

        match self.gate.check_and_enter(cluster) {
            GateDecision::Proceed => {}
            GateDecision::ReuseCachedError {
                message,
                retry_after,
            } => {
                return Ok(Snapshot::degraded(
                    cluster,
                    filter,
                    Availability::Unavailable {
                        reason: format!(
                            "temporarily unavailable, retry after cache expiry: {message}"
                        ),
                        retry_after: Some(retry_after),
                    },
                ));
            }
            GateDecision::ProbeInProgress => {
                return Ok(Snapshot::degraded(cluster, filter, Availability::Checking));
            }
        }

        let namespaces = match self.api.list_namespaces(self.deadline).await {
            Ok(namespaces) => {
                self.gate.report_success(cluster);
                namespaces
            }
            Err(e) => {
                warn!(error = %e, "Namespace canary failed, skipping remaining kinds");
                self.gate.report_failure(cluster, &e);
                return Ok(Snapshot::degraded(
                    cluster,
                    filter,
                    Availability::Unavailable {
                        reason: e.to_string(),
                        retry_after: Some(self.gate.error_ttl(e.failure_class())),
                    },
                ));
            }
        };

        let calls = SNAPSHOT_KINDS.iter().map(|&kind| {
            let scope = if kind.is_namespaced() {
                filter.clone()
            } else {
                None
            };
            async move { (kind, self.api.list(kind, scope, self.deadline).await) }
        });

        let mut kinds = BTreeMap::new();
        for (kind, result) in join_all(calls).await {
            let entry = match result {
                Ok(items) => {
                    debug!(kind = %kind, count = items.len(), "Listed resources");
                    KindResult { items, error: None }
                }
                Err(e) => {
                    debug!(kind = %kind, error = %e, "Resource list failed");
                    KindResult {
                        items: Vec::new(),
                        error: Some(e.to_string()),
                    }
                }
            };
            kinds.insert(kind, entry);
        }

        let snapshot = Snapshot {
            cluster: cluster.to_string(),
            namespace_filter: filter,
            availability: Availability::Available,
            namespaces,
            kinds,
        };
        info!(
            namespaces = snapshot.namespaces.len(),
            kind_errors = snapshot.errors().len(),
            "Snapshot complete"
        );
        Ok(snapshot)
    }
}

/// Namespace names are RFC 1123 labels: lowercase alphanumerics and '-',
/// at most 63 characters, starting and ending with an alphanumeric.
fn validate_namespace(ns: &str) -> Result<()> {
    let valid = ns.len() <= 63
        && ns
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !ns.starts_with('-')
        && !ns.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_request(format!(
            "invalid namespace filter: {ns}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockClusterApi;
    use crate::gate::ProbeStatus;
    use deckhand_common::{FailureClass, GateConfig};
    use mockall::predicate::*;

    const DEADLINE: Duration = Duration::from_secs(6);

    fn object(name: &str) -> DynamicObject {
        let ar = ResourceKind::Pod.api_resource();
        DynamicObject::new(name, &ar)
    }

    fn fetcher(mock: MockClusterApi) -> (SnapshotFetcher, ConnectivityGate) {
        let gate = ConnectivityGate::in_memory(GateConfig::default());
        (
            SnapshotFetcher::new(Arc::new(mock), gate.clone(), DEADLINE),
            gate,
        )
    }

    // ==========================================================================
    // Story Tests: Canary
    // ==========================================================================

    /// Story: a dead cluster costs one canary call and nothing else
    #[tokio::test(start_paused = true)]
    async fn story_canary_failure_short_circuits() {
        let mut mock = MockClusterApi::new();
        mock.expect_list_namespaces()
            .times(1)
            .returning(|_| Err(Error::deadline_exceeded("prod", "list namespaces")));
        mock.expect_list().never();

        let (fetcher, gate) = fetcher(mock);
        let snapshot = fetcher.fetch_snapshot("prod", None).await.unwrap();

        assert!(!snapshot.is_available());
        assert!(snapshot.kinds.is_empty());
        match &snapshot.availability {
            Availability::Unavailable {
                reason,
                retry_after,
            } => {
                assert!(reason.contains("list namespaces timed out"));
                assert_eq!(*retry_after, Some(Duration::from_secs(300)));
            }
            other => panic!("Expected Unavailable, got {other:?}"),
        }
        assert_eq!(
            gate.cached_error("prod").map(|c| c.class),
            Some(FailureClass::Timeout)
        );
    }

    /// Story: once the failure is cached, later snapshots make no calls at all
    #[tokio::test(start_paused = true)]
    async fn story_cached_failure_skips_network() {
        let mut mock = MockClusterApi::new();
        mock.expect_list_namespaces().times(1).returning(|_| {
            Err(Error::connectivity(
                "prod",
                FailureClass::Transient,
                "connection closed",
            ))
        });
        mock.expect_list().never();

        let (fetcher, _gate) = fetcher(mock);
        fetcher.fetch_snapshot("prod", None).await.unwrap();

        for _ in 0..3 {
            let snapshot = fetcher.fetch_snapshot("prod", None).await.unwrap();
            match snapshot.availability {
                Availability::Unavailable { reason, .. } => {
                    assert!(reason.contains("retry after cache expiry"));
                    assert!(reason.contains("connection closed"));
                }
                other => panic!("Expected Unavailable, got {other:?}"),
            }
        }
    }

    /// Story: a caller arriving mid-probe is told the check is in progress
    #[tokio::test(start_paused = true)]
    async fn story_probe_in_progress_reports_checking() {
        let mut mock = MockClusterApi::new();
        mock.expect_list_namespaces().never();
        mock.expect_list().never();

        let (fetcher, gate) = fetcher(mock);
        assert_eq!(gate.check_and_enter("prod"), GateDecision::Proceed);

        let snapshot = fetcher.fetch_snapshot("prod", None).await.unwrap();
        assert_eq!(snapshot.availability, Availability::Checking);
    }

    // ==========================================================================
    // Story Tests: Fan-out
    // ==========================================================================

    /// Story: a healthy cluster yields every kind, even empty ones
    #[tokio::test(start_paused = true)]
    async fn story_healthy_snapshot_lists_every_kind() {
        let mut mock = MockClusterApi::new();
        mock.expect_list_namespaces()
            .with(eq(DEADLINE))
            .returning(|_| Ok(vec!["default".to_string(), "kube-system".to_string()]));
        mock.expect_list()
            .times(SNAPSHOT_KINDS.len())
            .returning(|kind, _, _| match kind {
                ResourceKind::Pod => Ok(vec![object("web-0"), object("web-1")]),
                _ => Ok(Vec::new()),
            });

        let (fetcher, gate) = fetcher(mock);
        let snapshot = fetcher.fetch_snapshot("prod", None).await.unwrap();

        assert!(snapshot.is_available());
        assert_eq!(snapshot.namespaces, vec!["default", "kube-system"]);
        assert_eq!(snapshot.kinds.len(), SNAPSHOT_KINDS.len());
        assert_eq!(snapshot.items(ResourceKind::Pod).len(), 2);
        assert!(snapshot.items(ResourceKind::Secret).is_empty());
        assert!(snapshot.errors().is_empty());
        assert_eq!(gate.state("prod").status, ProbeStatus::Healthy);
    }

    /// Story: missing RBAC on secrets is a per-kind error, not an outage
    #[tokio::test(start_paused = true)]
    async fn story_per_kind_error_is_not_cached() {
        let mut mock = MockClusterApi::new();
        mock.expect_list_namespaces()
            .returning(|_| Ok(vec!["default".to_string()]));
        mock.expect_list().returning(|kind, _, _| match kind {
            ResourceKind::Secret => Err(Error::connectivity(
                "prod",
                FailureClass::Transient,
                "secrets is forbidden (403)",
            )),
            _ => Ok(vec![object("x")]),
        });

        let (fetcher, gate) = fetcher(mock);
        let snapshot = fetcher.fetch_snapshot("prod", None).await.unwrap();

        assert!(snapshot.is_available());
        let errors = snapshot.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, ResourceKind::Secret);
        assert!(errors[0].1.contains("forbidden"));
        assert_eq!(snapshot.items(ResourceKind::Pod).len(), 1);
        assert!(gate.cached_error("prod").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_namespace_filter_scopes_namespaced_kinds_only() {
        let mut mock = MockClusterApi::new();
        mock.expect_list_namespaces()
            .returning(|_| Ok(vec!["team-a".to_string()]));
        mock.expect_list()
            .withf(|kind, ns, _| {
                if *kind == ResourceKind::Node {
                    ns.is_none()
                } else {
                    ns.as_deref() == Some("team-a")
                }
            })
            .times(SNAPSHOT_KINDS.len())
            .returning(|_, _, _| Ok(Vec::new()));

        let (fetcher, _gate) = fetcher(mock);
        let snapshot = fetcher.fetch_snapshot("prod", Some("team-a")).await.unwrap();
        assert_eq!(snapshot.namespace_filter.as_deref(), Some("team-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_filter_means_all_namespaces() {
        let mut mock = MockClusterApi::new();
        mock.expect_list_namespaces().returning(|_| Ok(Vec::new()));
        mock.expect_list()
            .withf(|_, ns, _| ns.is_none())
            .returning(|_, _, _| Ok(Vec::new()));

        let (fetcher, _gate) = fetcher(mock);
        let snapshot = fetcher.fetch_snapshot("prod", Some("")).await.unwrap();
        assert!(snapshot.namespace_filter.is_none());
    }

    #[tokio::test]
    async fn test_invalid_filter_rejected_before_any_call() {
        let mut mock = MockClusterApi::new();
        mock.expect_list_namespaces().never();

        let (fetcher, gate) = fetcher(mock);
        let err = fetcher
            .fetch_snapshot("prod", Some("Bad_Namespace"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));
        assert_eq!(gate.state("prod").status, ProbeStatus::Idle);
    }

    #[test]
    fn test_validate_namespace() {
        assert!(validate_namespace("default").is_ok());
        assert!(validate_namespace("team-a-1").is_ok());
        assert!(validate_namespace("-lead").is_err());
        assert!(validate_namespace("trail-").is_err());
        assert!(validate_namespace("Upper").is_err());
        assert!(validate_namespace(&"a".repeat(64)).is_err());
    }
}
