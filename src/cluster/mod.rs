use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use kube::api::ApiResource;
use serde_json::Value;

use crate::extract::CONTAINER_PATHS;

pub mod client;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Request to the cluster API failed: {0}")]
    Api(#[from] kube::Error),
    #[error("Could not decode a cluster object: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupVersionKind {
    /// Empty for the core API group.
    pub group:   &'static str,
    pub version: &'static str,
    pub kind:    &'static str,
}

impl Display for GroupVersionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}, Kind={}", self.version, self.kind)
        } else {
            write!(f, "{}/{}, Kind={}", self.group, self.version, self.kind)
        }
    }
}

/// A namespaced resource type as addressed by the REST API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub gvk:    GroupVersionKind,
    pub plural: &'static str,
}

impl ResourceKind {
    const fn new(group: &'static str, version: &'static str, kind: &'static str, plural: &'static str) -> Self {
        Self {
            gvk: GroupVersionKind { group, version, kind },
            plural,
        }
    }

    /// The dynamic API resource for `Api<DynamicObject>`.
    pub(crate) fn api_resource(&self) -> ApiResource {
        let GroupVersionKind { group, version, kind } = self.gvk;
        ApiResource {
            group:       group.to_owned(),
            version:     version.to_owned(),
            api_version: if group.is_empty() { version.to_owned() } else { format!("{group}/{version}") },
            kind:        kind.to_owned(),
            plural:      self.plural.to_owned(),
        }
    }
}

pub const SECRET: ResourceKind = ResourceKind::new("", "v1", "Secret", "secrets");
pub const SERVICE_ACCOUNT: ResourceKind = ResourceKind::new("", "v1", "ServiceAccount", "serviceaccounts");

/// A kind whose objects define containers, and where to find them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchedResourceKind {
    pub resource:         ResourceKind,
    pub extraction_paths: &'static [&'static [&'static str]],
}

impl WatchedResourceKind {
    pub(crate) const fn gvk(&self) -> &GroupVersionKind {
        &self.resource.gvk
    }
}

const fn watched(group: &'static str, version: &'static str, kind: &'static str, plural: &'static str) -> WatchedResourceKind {
    WatchedResourceKind {
        resource:         ResourceKind::new(group, version, kind, plural),
        extraction_paths: CONTAINER_PATHS,
    }
}

pub static WATCHED_KINDS: [WatchedResourceKind; 6] = [
    watched("", "v1", "Pod", "pods"),
    watched("apps", "v1", "Deployment", "deployments"),
    watched("apps", "v1", "StatefulSet", "statefulsets"),
    watched("apps", "v1", "DaemonSet", "daemonsets"),
    watched("batch", "v1", "Job", "jobs"),
    watched("batch", "v1", "CronJob", "cronjobs"),
];

/// Namespace and name of one object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name:      String,
}

impl ObjectKey {
    pub(crate) fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name:      name.into(),
        }
    }

    /// Reads `metadata.namespace` and `metadata.name`.
    pub(crate) fn of(object: &Value) -> Option<Self> {
        let metadata = object.get("metadata")?;
        Some(Self::new(
            metadata.get("namespace").and_then(Value::as_str).unwrap_or_default(),
            metadata.get("name").and_then(Value::as_str)?,
        ))
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Read access to cluster objects as untyped JSON.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> Result<Option<Value>, ClusterError>;

    /// Every object of `kind` across all namespaces.
    async fn list(&self, kind: &ResourceKind) -> Result<Vec<Value>, ClusterError>;
}
