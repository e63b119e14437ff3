//! One-off cluster operations
//!
//! Single calls issued on behalf of a user action (inspect, delete, scale,
//! restart). They do not take the probe: a cached connectivity failure fails
//! them fast, and a fresh connectivity failure they observe is cached for
//! everyone else.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use kube::api::DynamicObject;
use serde_json::json;
use tracing::{info, instrument};

use deckhand_common::{Error, Result};

use crate::api::{ClusterApi, ResourceKind};
use crate::gate::ConnectivityGate;

/// Annotation `kubectl rollout restart` sets on the pod template
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Gated single-shot operations against one cluster
#[derive(Clone)]
pub struct ClusterOps {
    api: Arc<dyn ClusterApi>,
    gate: ConnectivityGate,
    cluster: String,
    deadline: Duration,
}

impl ClusterOps {
    /// Create operations for `cluster`; `deadline` bounds each call
    pub fn new(
        api: Arc<dyn ClusterApi>,
        gate: ConnectivityGate,
        cluster: impl Into<String>,
        deadline: Duration,
    ) -> Self {
        Self {
            api,
            gate,
            cluster: cluster.into(),
            deadline,
        }
    }

    /// Fetch one object by kind name (`pod`, `deploy`, `svc`, ...)
    #[instrument(skip(self), fields(cluster = %self.cluster))]
    pub async fn get_resource(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject> {
        let kind: ResourceKind = kind.parse()?;
        let namespace = if kind.is_namespaced() {
            namespace.map(str::to_string)
        } else {
            None
        };
        self.fail_fast()?;
        let result = self
            .api
            .get(kind, namespace, name.to_string(), self.deadline)
            .await;
        self.observe(result)
    }

    /// Delete a pod; its controller will typically recreate it
    #[instrument(skip(self), fields(cluster = %self.cluster))]
    pub async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.fail_fast()?;
        let result = self
            .api
            .delete(
                ResourceKind::Pod,
                Some(namespace.to_string()),
                name.to_string(),
                self.deadline,
            )
            .await;
        self.observe(result)?;
        info!(namespace, pod = name, "Deleted pod");
        Ok(())
    }

    /// Set a deployment's replica count
    #[instrument(skip(self), fields(cluster = %self.cluster))]
    pub async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<DynamicObject> {
        if replicas < 0 {
            return Err(Error::invalid_request(format!(
                "replicas must be non-negative, got {replicas}"
            )));
        }
        self.fail_fast()?;
        let patch = json!({ "spec": { "replicas": replicas } });
        let result = self
            .api
            .patch_merge(
                ResourceKind::Deployment,
                Some(namespace.to_string()),
                name.to_string(),
                patch,
                self.deadline,
            )
            .await;
        let deployment = self.observe(result)?;
        info!(namespace, deployment = name, replicas, "Scaled deployment");
        Ok(deployment)
    }

    /// Trigger a rolling restart by stamping the pod template
    #[instrument(skip(self), fields(cluster = %self.cluster))]
    pub async fn restart_deployment(&self, namespace: &str, name: &str) -> Result<DynamicObject> {
        self.fail_fast()?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let patch = restart_patch(&now);
        let result = self
            .api
            .patch_merge(
                ResourceKind::Deployment,
                Some(namespace.to_string()),
                name.to_string(),
                patch,
                self.deadline,
            )
            .await;
        let deployment = self.observe(result)?;
        info!(namespace, deployment = name, restarted_at = %now, "Restarted deployment");
        Ok(deployment)
    }

    fn fail_fast(&self) -> Result<()> {
        match self.gate.cached_error(&self.cluster) {
            Some(cached) => Err(Error::connectivity(
                self.cluster.as_str(),
                cached.class,
                format!(
                    "temporarily unavailable, retry after cache expiry ({}s): {}",
                    cached.retry_after.as_secs(),
                    cached.message
                ),
            )),
            None => Ok(()),
        }
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_cacheable() {
                self.gate.cache_failure(&self.cluster, e);
            }
        }
        result
    }
}

fn restart_patch(timestamp: &str) -> serde_json::Value {
    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": { RESTARTED_AT_ANNOTATION: timestamp }
                }
            }
        }
    })
}
