//! deckhand - background cluster snapshot poller
//!
//! Loads `~/.deckhand/config.json` (or `$DECKHAND_CONFIG`), then snapshots
//! every configured cluster on a fixed interval through one shared
//! connectivity gate until interrupted.

mod poller;

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use deckhand_cluster::{ConnectivityGate, KubeClusterApi, SnapshotFetcher};
use deckhand_common::telemetry::{init_telemetry, TelemetryConfig};
use deckhand_common::DeckhandConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DeckhandConfig::load(None).context("loading configuration")?;

    init_telemetry(TelemetryConfig {
        format: config.log_format,
        ..Default::default()
    })?;

    if config.clusters.is_empty() {
        bail!("no clusters configured");
    }

    let gate = ConnectivityGate::in_memory(config.gate.clone());
    let token = CancellationToken::new();
    let mut pollers = Vec::new();

    for cluster in &config.clusters {
        let api = match KubeClusterApi::connect(cluster, &config.fetch).await {
            Ok(api) => api,
            Err(e) => {
                error!(
                    cluster = %cluster.name,
                    error = %e,
                    "Failed to build cluster client, skipping"
                );
                continue;
            }
        };
        let fetcher =
            SnapshotFetcher::new(Arc::new(api), gate.clone(), config.fetch.call_deadline());
        pollers.push(tokio::spawn(poller::run(
            cluster.name.clone(),
            fetcher,
            config.poller.interval(),
            token.clone(),
        )));
    }

    if pollers.is_empty() {
        bail!("no cluster client could be built");
    }

    info!(clusters = pollers.len(), "deckhand started");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");

    token.cancel();
    for poller in pollers {
        if let Err(e) = poller.await {
            error!(error = %e, "Poller task failed");
        }
    }
    Ok(())
}
