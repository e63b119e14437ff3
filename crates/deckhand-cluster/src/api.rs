//! Cluster API client
//!
//! [`ClusterApi`] is the only way the rest of the crate talks to a cluster.
//! Every call takes an explicit deadline and fails with a connectivity error
//! once the deadline passes, so no caller can hang on a dead API server.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Namespace, Node, Pod, Secret, Service};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde::Serialize;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use deckhand_common::kube_utils::{create_client_with_timeout, with_deadline};
use deckhand_common::{ClusterConfig, Error, FetchConfig, Result};

/// Resource kinds deckhand knows how to list and inspect
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// core/v1 Namespace
    Namespace,
    /// core/v1 Pod
    Pod,
    /// apps/v1 Deployment
    Deployment,
    /// core/v1 Service
    Service,
    /// core/v1 ConfigMap
    ConfigMap,
    /// core/v1 Secret
    Secret,
    /// core/v1 Event
    Event,
    /// core/v1 Node
    Node,
}

/// Kinds fetched after the namespace canary succeeds
pub const SNAPSHOT_KINDS: [ResourceKind; 7] = [
    ResourceKind::Pod,
    ResourceKind::Deployment,
    ResourceKind::Service,
    ResourceKind::ConfigMap,
    ResourceKind::Secret,
    ResourceKind::Event,
    ResourceKind::Node,
];

impl ResourceKind {
    /// Whether objects of this kind live inside a namespace
    pub fn is_namespaced(self) -> bool {
        !matches!(self, ResourceKind::Namespace | ResourceKind::Node)
    }

    /// Lowercase singular name
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Namespace => "namespace",
            ResourceKind::Pod => "pod",
            ResourceKind::Deployment => "deployment",
            ResourceKind::Service => "service",
            ResourceKind::ConfigMap => "configmap",
            ResourceKind::Secret => "secret",
            ResourceKind::Event => "event",
            ResourceKind::Node => "node",
        }
    }

    /// Dynamic API descriptor for this kind
    pub fn api_resource(self) -> ApiResource {
        match self {
            ResourceKind::Namespace => ApiResource::erase::<Namespace>(&()),
            ResourceKind::Pod => ApiResource::erase::<Pod>(&()),
            ResourceKind::Deployment => ApiResource::erase::<Deployment>(&()),
            ResourceKind::Service => ApiResource::erase::<Service>(&()),
            ResourceKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            ResourceKind::Secret => ApiResource::erase::<Secret>(&()),
            ResourceKind::Event => ApiResource::erase::<Event>(&()),
            ResourceKind::Node => ApiResource::erase::<Node>(&()),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "namespace" | "namespaces" | "ns" => Ok(ResourceKind::Namespace),
            "pod" | "pods" | "po" => Ok(ResourceKind::Pod),
            "deployment" | "deployments" | "deploy" => Ok(ResourceKind::Deployment),
            "service" | "services" | "svc" => Ok(ResourceKind::Service),
            "configmap" | "configmaps" | "cm" => Ok(ResourceKind::ConfigMap),
            "secret" | "secrets" => Ok(ResourceKind::Secret),
            "event" | "events" | "ev" => Ok(ResourceKind::Event),
            "node" | "nodes" | "no" => Ok(ResourceKind::Node),
            other => Err(Error::invalid_request(format!(
                "unknown resource kind: {other}"
            ))),
        }
    }
}

/// Bounded-deadline operations against one cluster
///
/// This trait allows mocking the cluster in tests while using the real
/// kube client in production. Implementations must return a
/// timeout-class connectivity error once `deadline` passes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List namespace names; used as the connectivity canary
    async fn list_namespaces(&self, deadline: Duration) -> Result<Vec<String>>;

    /// List objects of `kind`, scoped to `namespace` when the kind is namespaced
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<String>,
        deadline: Duration,
    ) -> Result<Vec<DynamicObject>>;

    /// Get one object
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<String>,
        name: String,
        deadline: Duration,
    ) -> Result<DynamicObject>;

    /// Delete one object
    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<String>,
        name: String,
        deadline: Duration,
    ) -> Result<()>;

    /// Apply a JSON merge patch and return the patched object
    async fn patch_merge(
        &self,
        kind: ResourceKind,
        namespace: Option<String>,
        name: String,
        patch: serde_json::Value,
        deadline: Duration,
    ) -> Result<DynamicObject>;
}

/// [`ClusterApi`] backed by a kube-rs client
#[derive(Clone)]
pub struct KubeClusterApi {
    cluster: String,
    client: Client,
}

impl KubeClusterApi {
    /// Wrap an existing client
    pub fn new(cluster: impl Into<String>, client: Client) -> Self {
        Self {
            cluster: cluster.into(),
            client,
        }
    }

    /// Build a client for a configured cluster with the fetch timeouts applied
    pub async fn connect(cluster: &ClusterConfig, fetch: &FetchConfig) -> Result<Self> {
        let client = create_client_with_timeout(
            cluster.kubeconfig.as_deref(),
            cluster.context.as_deref(),
            fetch.connect_timeout(),
            fetch.read_timeout(),
        )
        .await?;
        Ok(Self::new(cluster.name.clone(), client))
    }

    /// Cluster key this client reports errors under
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    fn dynamic_api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) if kind.is_namespaced() => {
                Api::namespaced_with(self.client.clone(), ns, &ar)
            }
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    /// Api for a single named object; namespaced kinds require a namespace
    fn object_api(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>> {
        if kind.is_namespaced() && namespace.is_none() {
            return Err(Error::invalid_request(format!(
                "{kind} requires a namespace"
            )));
        }
        Ok(self.dynamic_api(kind, namespace))
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    #[instrument(skip(self), fields(cluster = %self.cluster))]
    async fn list_namespaces(&self, deadline: Duration) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespaces = with_deadline(&self.cluster, "list namespaces", deadline, async {
            api.list(&ListParams::default())
                .await
                .map_err(|e| Error::from_kube(&self.cluster, "namespace", None, None, e))
        })
        .await?;

        debug!(count = namespaces.items.len(), "Listed namespaces");
        Ok(namespaces.items.iter().map(|ns| ns.name_any()).collect())
    }

    #[instrument(skip(self), fields(cluster = %self.cluster))]
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<String>,
        deadline: Duration,
    ) -> Result<Vec<DynamicObject>> {
        let api = self.dynamic_api(kind, namespace.as_deref());
        let operation = format!("list {kind}");
        let list = with_deadline(&self.cluster, &operation, deadline, async {
            api.list(&ListParams::default()).await.map_err(|e| {
                Error::from_kube(&self.cluster, kind.as_str(), namespace.as_deref(), None, e)
            })
        })
        .await?;
        Ok(list.items)
    }

    #[instrument(skip(self), fields(cluster = %self.cluster))]
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<String>,
        name: String,
        deadline: Duration,
    ) -> Result<DynamicObject> {
        let api = self.object_api(kind, namespace.as_deref())?;
        let operation = format!("get {kind} {name}");
        with_deadline(&self.cluster, &operation, deadline, async {
            api.get(&name).await.map_err(|e| {
                Error::from_kube(
                    &self.cluster,
                    kind.as_str(),
                    namespace.as_deref(),
                    Some(&name),
                    e,
                )
            })
        })
        .await
    }

    #[instrument(skip(self), fields(cluster = %self.cluster))]
    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<String>,
        name: String,
        deadline: Duration,
    ) -> Result<()> {
        let api = self.object_api(kind, namespace.as_deref())?;
        let operation = format!("delete {kind} {name}");
        with_deadline(&self.cluster, &operation, deadline, async {
            api.delete(&name, &DeleteParams::default())
                .await
                .map(|_| ())
                .map_err(|e| {
                    Error::from_kube(
                        &self.cluster,
                        kind.as_str(),
                        namespace.as_deref(),
                        Some(&name),
                        e,
                    )
                })
        })
        .await
    }

    #[instrument(skip(self, patch), fields(cluster = %self.cluster))]
    async fn patch_merge(
        &self,
        kind: ResourceKind,
        namespace: Option<String>,
        name: String,
        patch: serde_json::Value,
        deadline: Duration,
    ) -> Result<DynamicObject> {
        let api = self.object_api(kind, namespace.as_deref())?;
        let operation = format!("patch {kind} {name}");
        with_deadline(&self.cluster, &operation, deadline, async {
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| {
                    Error::from_kube(
                        &self.cluster,
                        kind.as_str(),
                        namespace.as_deref(),
                        Some(&name),
                        e,
                    )
                })
        })
        .await
    }
}

impl fmt::Debug for KubeClusterApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeClusterApi")
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_aliases_parse() {
        let cases = [
            ("pod", ResourceKind::Pod),
            ("pods", ResourceKind::Pod),
            ("po", ResourceKind::Pod),
            ("deploy", ResourceKind::Deployment),
            ("Deployment", ResourceKind::Deployment),
            ("svc", ResourceKind::Service),
            ("cm", ResourceKind::ConfigMap),
            ("secret", ResourceKind::Secret),
            ("ev", ResourceKind::Event),
            ("no", ResourceKind::Node),
            ("ns", ResourceKind::Namespace),
        ];
        for (input, expected) in cases {
            assert_eq!(input.parse::<ResourceKind>().unwrap(), expected, "{input}");
        }
    }

    #[test]
    fn test_unknown_kind_is_invalid_request() {
        let err = "gadget".parse::<ResourceKind>().unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));
        assert!(err.to_string().contains("gadget"));
        assert!(!err.is_cacheable());
    }

    #[test]
    fn test_cluster_scoped_kinds() {
        assert!(!ResourceKind::Node.is_namespaced());
        assert!(!ResourceKind::Namespace.is_namespaced());
        for kind in SNAPSHOT_KINDS.iter().filter(|k| **k != ResourceKind::Node) {
            assert!(kind.is_namespaced(), "{kind} should be namespaced");
        }
    }

    #[test]
    fn test_api_resources_use_expected_groups() {
        let deploy = ResourceKind::Deployment.api_resource();
        assert_eq!(deploy.group, "apps");
        assert_eq!(deploy.plural, "deployments");

        let event = ResourceKind::Event.api_resource();
        assert_eq!(event.group, "");
        assert_eq!(event.version, "v1");
        assert_eq!(event.kind, "Event");
    }

    #[test]
    fn test_snapshot_kinds_exclude_canary() {
        assert!(!SNAPSHOT_KINDS.contains(&ResourceKind::Namespace));
        assert_eq!(SNAPSHOT_KINDS.len(), 7);
    }

    #[test]
    fn test_display_matches_as_str() {
        assert_eq!(ResourceKind::ConfigMap.to_string(), "configmap");
    }
}
