//! deckhand configuration.
//!
//! Loaded from a JSON file. The file resolution chain (highest priority first):
//! 1. Explicit path passed to [`DeckhandConfig::load`]
//! 2. `DECKHAND_CONFIG` environment variable
//! 3. `~/.deckhand/config.json`
//! 4. Built-in defaults when none of the above exists

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::telemetry::LogFormat;
use crate::{Error, Result};

const CONFIG_DIR_NAME: &str = ".deckhand";
const CONFIG_FILE_NAME: &str = "config.json";
const DECKHAND_CONFIG_ENV: &str = "DECKHAND_CONFIG";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DeckhandConfig {
    /// Clusters to poll
    pub clusters: Vec<ClusterConfig>,
    /// Connectivity gate TTLs
    pub gate: GateConfig,
    /// Bounded timeouts for cluster calls
    pub fetch: FetchConfig,
    /// Exec session settings
    pub exec: ExecConfig,
    /// Background poller settings
    pub poller: PollerConfig,
    /// Log output format
    pub log_format: LogFormat,
}

/// One cluster target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Key the gate tracks this cluster under
    pub name: String,
    /// Kubeconfig path; falls back to the kube default chain when unset
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context to use
    #[serde(default)]
    pub context: Option<String>,
}

/// Connectivity gate lifetimes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct GateConfig {
    /// How long a probe marker stays valid before an abandoned probe is released
    pub probe_ttl_secs: u64,
    /// Cache lifetime for timeout/unreachable failures
    pub timeout_error_ttl_secs: u64,
    /// Cache lifetime for any other failure
    pub transient_error_ttl_secs: u64,
    /// How long a successful probe is reported as healthy
    pub healthy_ttl_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            probe_ttl_secs: 10,
            timeout_error_ttl_secs: 300,
            transient_error_ttl_secs: 30,
            healthy_ttl_secs: 30,
        }
    }
}

impl GateConfig {
    /// Probe marker lifetime
    pub fn probe_ttl(&self) -> Duration {
        Duration::from_secs(self.probe_ttl_secs)
    }

    /// Cached timeout-failure lifetime
    pub fn timeout_error_ttl(&self) -> Duration {
        Duration::from_secs(self.timeout_error_ttl_secs)
    }

    /// Cached transient-failure lifetime
    pub fn transient_error_ttl(&self) -> Duration {
        Duration::from_secs(self.transient_error_ttl_secs)
    }

    /// Healthy verdict lifetime
    pub fn healthy_ttl(&self) -> Duration {
        Duration::from_secs(self.healthy_ttl_secs)
    }
}

/// Timeouts for canary and per-kind calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct FetchConfig {
    /// TCP/TLS connect timeout
    pub connect_timeout_ms: u64,
    /// Response read timeout
    pub read_timeout_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2_000,
            read_timeout_ms: 4_000,
        }
    }
}

impl FetchConfig {
    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Hard upper bound for one call: connect plus read
    pub fn call_deadline(&self) -> Duration {
        self.connect_timeout() + self.read_timeout()
    }
}

/// Exec session settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecConfig {
    /// How long the pump waits on the channel per iteration
    pub poll_interval_ms: u64,
    /// Maximum number of retained output chunks; unbounded when unset
    pub history_limit: Option<usize>,
    /// How long a closed session stays around for final history reads
    pub retention_secs: u64,
    /// Command started in the target container
    pub command: Vec<String>,
    /// Request a TTY (stderr is merged into stdout by the remote end)
    pub tty: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            history_limit: None,
            retention_secs: 60,
            command: vec!["sh".to_string()],
            tty: true,
        }
    }
}

impl ExecConfig {
    /// Pump poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Closed-session retention
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Background poller settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PollerConfig {
    /// Seconds between snapshots of each cluster
    pub interval_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { interval_secs: 5 }
    }
}

impl PollerConfig {
    /// Poll interval
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl DeckhandConfig {
    /// Resolve and load the configuration file, then validate it.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config = match resolve_config_path(explicit)? {
            Some(path) => {
                debug!(path = %path.display(), "Loading configuration");
                Self::from_file(&path)?
            }
            None => {
                debug!("No configuration file found, using defaults");
                Self::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration file without validating it
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_json(&data)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Parse configuration from a JSON string
    pub fn from_json(data: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    /// Reject settings that would disable the gate or stall the pump
    pub fn validate(&self) -> Result<()> {
        let gate = &self.gate;
        if gate.probe_ttl_secs == 0
            || gate.timeout_error_ttl_secs == 0
            || gate.transient_error_ttl_secs == 0
        {
            return Err(Error::config("gate TTLs must be greater than zero"));
        }
        if self.fetch.connect_timeout_ms == 0 || self.fetch.read_timeout_ms == 0 {
            return Err(Error::config("fetch timeouts must be greater than zero"));
        }
        if self.exec.poll_interval_ms == 0 {
            return Err(Error::config("exec pollIntervalMs must be greater than zero"));
        }
        if self.exec.command.is_empty() {
            return Err(Error::config("exec command must not be empty"));
        }
        if self.poller.interval_secs == 0 {
            return Err(Error::config("poller intervalSecs must be greater than zero"));
        }

        let mut seen = HashSet::new();
        for cluster in &self.clusters {
            if cluster.name.is_empty() {
                return Err(Error::config("cluster name must not be empty"));
            }
            if !seen.insert(cluster.name.as_str()) {
                return Err(Error::config(format!(
                    "duplicate cluster name: {}",
                    cluster.name
                )));
            }
        }
        Ok(())
    }
}

fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        return Ok(Some(path.to_path_buf()));
    }
    if let Ok(path) = std::env::var(DECKHAND_CONFIG_ENV) {
        if !path.is_empty() {
            return Ok(Some(PathBuf::from(path)));
        }
    }
    let Some(home) = dirs::home_dir() else {
        return Ok(None);
    };
    let default_path = home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
    Ok(default_path.exists().then_some(default_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = DeckhandConfig::default();
        assert_eq!(config.gate.probe_ttl(), Duration::from_secs(10));
        assert_eq!(config.gate.timeout_error_ttl(), Duration::from_secs(300));
        assert_eq!(config.gate.transient_error_ttl(), Duration::from_secs(30));
        assert_eq!(config.fetch.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.fetch.read_timeout(), Duration::from_secs(4));
        assert_eq!(config.fetch.call_deadline(), Duration::from_secs(6));
        assert_eq!(config.exec.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.exec.history_limit, None);
        assert_eq!(config.exec.command, vec!["sh".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = DeckhandConfig::from_json(
            r#"{
                "clusters": [{"name": "prod", "context": "prod-admin"}],
                "gate": {"transientErrorTtlSecs": 15},
                "exec": {"historyLimit": 500}
            }"#,
        )
        .unwrap();

        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].context.as_deref(), Some("prod-admin"));
        assert!(config.clusters[0].kubeconfig.is_none());
        assert_eq!(config.gate.transient_error_ttl_secs, 15);
        assert_eq!(config.gate.timeout_error_ttl_secs, 300);
        assert_eq!(config.exec.history_limit, Some(500));
        assert_eq!(config.exec.poll_interval_ms, 100);
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let mut config = DeckhandConfig::default();
        config.gate.probe_ttl_secs = 0;
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let mut config = DeckhandConfig::default();
        config.exec.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_clusters() {
        let cluster = ClusterConfig {
            name: "prod".to_string(),
            kubeconfig: None,
            context: None,
        };
        let config = DeckhandConfig {
            clusters: vec![cluster.clone(), cluster],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate cluster name: prod"));
    }

    #[test]
    fn test_explicit_path_wins() {
        let path = Path::new("/tmp/deckhand-explicit.json");
        assert_eq!(
            resolve_config_path(Some(path)).unwrap(),
            Some(path.to_path_buf())
        );
    }

    #[test]
    fn test_load_reports_unreadable_file() {
        let err = DeckhandConfig::load(Some(Path::new("/nonexistent/deckhand.json"))).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("/nonexistent/deckhand.json"));
    }

    #[test]
    fn test_load_reads_explicit_file() {
        let dir = std::env::temp_dir().join(format!("deckhand-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, r#"{"poller": {"intervalSecs": 12}}"#).unwrap();

        let config = DeckhandConfig::load(Some(&path)).unwrap();
        assert_eq!(config.poller.interval(), Duration::from_secs(12));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
