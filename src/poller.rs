//! Per-cluster snapshot polling loop

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use deckhand_cluster::{Availability, ResourceKind, Snapshot, SnapshotFetcher, SNAPSHOT_KINDS};

/// Compact per-snapshot numbers for the log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub namespaces: usize,
    pub pods: usize,
    pub deployments: usize,
    pub nodes: usize,
    pub objects: usize,
    pub failed_kinds: Vec<ResourceKind>,
}

pub fn summarize(snapshot: &Snapshot) -> SnapshotSummary {
    SnapshotSummary {
        namespaces: snapshot.namespaces.len(),
        pods: snapshot.items(ResourceKind::Pod).len(),
        deployments: snapshot.items(ResourceKind::Deployment).len(),
        nodes: snapshot.items(ResourceKind::Node).len(),
        objects: SNAPSHOT_KINDS
            .iter()
            .map(|kind| snapshot.items(*kind).len())
            .sum(),
        failed_kinds: snapshot.errors().into_iter().map(|(kind, _)| kind).collect(),
    }
}

/// Snapshot `cluster` every `interval` until `token` is cancelled
pub async fn run(
    cluster: String,
    fetcher: SnapshotFetcher,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(cluster = %cluster, interval_secs = interval.as_secs(), "Starting poller");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = tokio::select! {
            _ = token.cancelled() => break,
            result = fetcher.fetch_snapshot(&cluster, None) => result,
        };

        match snapshot {
            Ok(snapshot) => log_snapshot(&snapshot),
            Err(e) => error!(cluster = %cluster, error = %e, "Snapshot request rejected"),
        }
    }
    info!(cluster = %cluster, "Poller stopped");
}

fn log_snapshot(snapshot: &Snapshot) {
    match &snapshot.availability {
        Availability::Available => {
            let summary = summarize(snapshot);
            if summary.failed_kinds.is_empty() {
                info!(
                    cluster = %snapshot.cluster,
                    namespaces = summary.namespaces,
                    pods = summary.pods,
                    deployments = summary.deployments,
                    nodes = summary.nodes,
                    objects = summary.objects,
                    "Cluster snapshot"
                );
            } else {
                warn!(
                    cluster = %snapshot.cluster,
                    objects = summary.objects,
                    failed_kinds = ?summary.failed_kinds,
                    "Cluster snapshot incomplete"
                );
            }
        }
        Availability::Unavailable {
            reason,
            retry_after,
        } => warn!(
            cluster = %snapshot.cluster,
            reason = %reason,
            retry_after_secs = retry_after.map(|d| d.as_secs()),
            "Cluster unavailable"
        ),
        Availability::Checking => {
            debug!(cluster = %snapshot.cluster, "Connectivity check in progress")
        }
    }
}
