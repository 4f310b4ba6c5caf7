//! Client abstractions for the remote systems the engine drives.
//!
//! Orchestration logic only talks to these traits; concrete adapters live in
//! the submodules and are injected by the caller.

pub mod cloud;
pub mod kubernetes;
pub mod storage;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use cloud::{CloudResource, CloudTeardown, ProviderCliTeardown};
pub use kubernetes::KubeClusterClient;
pub use storage::{LocalObjectStore, MemoryObjectStore};

/// Interval between polls in the default `wait_for_condition`.
const CONDITION_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Cluster resource kinds the engine works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Namespace,
    Node,
    Pod,
    Deployment,
    StatefulSet,
    Service,
    Endpoints,
    Job,
    CronJob,
    Secret,
    PersistentVolumeClaim,
    NetworkPolicy,
    Ingress,
}

impl ResourceKind {
    /// Whether resources of this kind live outside namespaces.
    #[must_use]
    pub fn is_cluster_scoped(self) -> bool {
        matches!(self, Self::Namespace | Self::Node)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Normalized status of a single cluster resource.
///
/// Adapters fill in what applies to the kind: `phase` for pods, namespaces
/// and PVCs, replica counts for deployments and statefulsets, `conditions` as
/// `type -> status` ("True"/"False"/"Unknown").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub name: String,
    pub namespace: Option<String>,
    pub phase: Option<String>,
    pub ready: bool,
    pub desired_replicas: Option<i32>,
    pub ready_replicas: Option<i32>,
    pub restart_count: u32,
    pub conditions: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Kind-specific facts, e.g. `privileged`, `endpoints`, `tls`, `type`.
    pub attributes: BTreeMap<String, String>,
}

impl ResourceStatus {
    /// Whether the named condition is reported as "True".
    #[must_use]
    pub fn condition_true(&self, condition: &str) -> bool {
        self.conditions
            .get(condition)
            .is_some_and(|status| status == "True")
    }

    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Whether the labels satisfy an equality selector such as `app=postgres,tier=db`.
    #[must_use]
    pub fn matches_selector(&self, selector: &str) -> bool {
        selector
            .split(',')
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .all(|term| match term.split_once('=') {
                Some((key, value)) => {
                    self.labels.get(key.trim()).map(String::as_str) == Some(value.trim())
                }
                None => self.labels.contains_key(term),
            })
    }
}

/// Identifies the workload a command is executed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSelector {
    pub namespace: String,
    /// Label selector, e.g. `app=postgres`.
    pub label_selector: String,
    pub container: Option<String>,
}

impl std::fmt::Display for WorkloadSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.label_selector)
    }
}

/// Output of a command executed inside a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout decoded lossily and trimmed.
    #[must_use]
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Access to the container platform.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List resources of a kind, in a namespace or cluster-wide.
    async fn list_resources(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<ResourceStatus>>;

    /// Get a single resource; `None` when it does not exist.
    async fn get_resource_status(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ResourceStatus>>;

    /// Execute a command in the first running pod matching the selector.
    async fn exec_in_workload(
        &self,
        selector: &WorkloadSelector,
        command: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput>;

    /// Like [`exec_in_workload`](Self::exec_in_workload), but stdin is streamed
    /// from the `input` file and stdout into the `output` file. With no
    /// `output`, stdout is collected as usual; otherwise it is left empty.
    async fn exec_streaming(
        &self,
        selector: &WorkloadSelector,
        command: &[String],
        input: Option<&Path>,
        output: Option<&Path>,
    ) -> Result<ExecOutput>;

    /// Set the replica count of a deployment.
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    /// Delete a namespaced resource.
    async fn delete_resource(&self, kind: ResourceKind, namespace: &str, name: &str)
        -> Result<()>;

    /// Delete a namespace and everything in it.
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Wait until a resource reports `condition` as "True" (or, for the
    /// pseudo-condition `Deleted`, until it no longer exists).
    ///
    /// Returns `false` when the timeout expires first.
    async fn wait_for_condition(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        condition: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.get_resource_status(kind, namespace, name).await?;
            let met = match (&status, condition) {
                (None, "Deleted") => true,
                (Some(resource), cond) => resource.condition_true(cond),
                (None, _) => false,
            };
            if met {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(CONDITION_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

/// A stored object with its user metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
}

/// Listing entry for a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
}

/// Blob storage holding backup artifacts and the backup catalog.
#[async_trait]
pub trait ObjectStorageClient: Send + Sync {
    /// Store an object, replacing any object with the same key.
    async fn put(&self, key: &str, bytes: Vec<u8>, metadata: BTreeMap<String, String>)
        -> Result<()>;

    /// Fetch an object; `LifecycleError::NotFound` when missing.
    async fn get(&self, key: &str) -> Result<StoredObject>;

    /// Store the contents of a local file.
    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        metadata: BTreeMap<String, String>,
    ) -> Result<()> {
        let bytes = tokio::fs::read(path).await?;
        self.put(key, bytes, metadata).await
    }

    /// Download an object into a local file and return its metadata.
    async fn get_to_file(&self, key: &str, path: &Path) -> Result<BTreeMap<String, String>> {
        let object = self.get(key).await?;
        tokio::fs::write(path, &object.bytes).await?;
        Ok(object.metadata)
    }

    /// List objects whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Canonical URI for a key.
    fn uri(&self, key: &str) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pod, FakeCluster};

    #[test]
    fn test_selector_matching() {
        let mut status = ResourceStatus::default();
        status.labels.insert("app".into(), "postgres".into());
        status.labels.insert("tier".into(), "db".into());
        assert!(status.matches_selector("app=postgres"));
        assert!(status.matches_selector("app=postgres, tier=db"));
        assert!(status.matches_selector("tier"));
        assert!(!status.matches_selector("app=redis"));
    }

    #[tokio::test]
    async fn test_wait_for_deleted_condition() {
        let cluster = FakeCluster::new();
        assert!(cluster
            .wait_for_condition(
                ResourceKind::Pod,
                Some("platform"),
                "gone-0",
                "Deleted",
                Duration::from_millis(10),
            )
            .await
            .unwrap());

        cluster.add(ResourceKind::Pod, pod("platform", "stuck-0", "Pending"));
        assert!(!cluster
            .wait_for_condition(
                ResourceKind::Pod,
                Some("platform"),
                "stuck-0",
                "Ready",
                Duration::from_millis(10),
            )
            .await
            .unwrap());
    }
}
