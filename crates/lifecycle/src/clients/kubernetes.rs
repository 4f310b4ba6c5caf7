//! Kubernetes adapter for [`ClusterClient`].

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{
    Endpoints, Namespace, Node, PersistentVolumeClaim, Pod, Secret, Service,
};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{ClusterClient, ExecOutput, ResourceKind, ResourceStatus, WorkloadSelector};
use crate::error::{LifecycleError, Result};

type ExecInput = Box<dyn AsyncRead + Send + Unpin>;
type ExecSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Cluster client backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap an existing client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Create a client from a kubeconfig file path.
    pub async fn from_kubeconfig(path: &Path) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
            LifecycleError::Configuration(format!(
                "Failed to read kubeconfig from {}: {e}",
                path.display()
            ))
        })?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                LifecycleError::Configuration(format!(
                    "Failed to create Kubernetes config from kubeconfig: {e}"
                ))
            })?;
        let client = Client::try_from(config).map_err(|e| {
            LifecycleError::Configuration(format!("Failed to create Kubernetes client: {e}"))
        })?;
        Ok(Self { client })
    }

    /// Create a client from the ambient environment (in-cluster or `KUBECONFIG`).
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.map_err(|e| {
            LifecycleError::Configuration(format!("Failed to create Kubernetes client: {e}"))
        })?;
        Ok(Self { client })
    }

    fn scoped<K>(&self, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    async fn list_namespaced<K>(&self, namespace: Option<&str>, operation: &str) -> Result<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = self.scoped(namespace);
        api.list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| map_kube_error(operation, e))
    }

    async fn get_namespaced<K>(
        &self,
        namespace: Option<&str>,
        name: &str,
        operation: &str,
    ) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = self.scoped(namespace);
        api.get_opt(name)
            .await
            .map_err(|e| map_kube_error(operation, e))
    }

    async fn delete_namespaced<K>(&self, namespace: &str, name: &str, operation: &str) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(map_kube_error(operation, e)),
        }
    }

    /// Find a running pod matching the selector.
    async fn running_pod(&self, selector: &WorkloadSelector) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &selector.namespace);
        let list = pods
            .list(&ListParams::default().labels(&selector.label_selector))
            .await
            .map_err(|e| map_kube_error("list workload pods", e))?;
        list.items
            .iter()
            .find(|pod| {
                pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
            })
            .map(ResourceExt::name_any)
            .ok_or_else(|| LifecycleError::NotFound(format!("running pod for {selector}")))
    }

    /// Exec in a running pod, copying `input` to stdin and stdout to `sink`.
    /// Stdout is collected in memory when there is no sink.
    async fn attach(
        &self,
        selector: &WorkloadSelector,
        command: &[String],
        input: Option<ExecInput>,
        sink: Option<ExecSink>,
    ) -> Result<ExecOutput> {
        let pod_name = self.running_pod(selector).await?;
        debug!(pod = %pod_name, command = ?command, "Executing in workload");

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &selector.namespace);
        let mut params = AttachParams::default()
            .stdin(input.is_some())
            .stdout(true)
            .stderr(true);
        if let Some(container) = &selector.container {
            params = params.container(container.clone());
        }

        let mut attached = pods
            .exec(&pod_name, command.to_vec(), &params)
            .await
            .map_err(|e| map_kube_error("exec", e))?;

        let stdin_writer = attached.stdin();
        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let status = attached.take_status();

        let write = async move {
            if let (Some(mut writer), Some(mut input)) = (stdin_writer, input) {
                tokio::io::copy(&mut input, &mut writer).await?;
                writer.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_stdout = async move {
            let mut buf = Vec::new();
            if let Some(mut reader) = stdout_reader {
                match sink {
                    Some(mut sink) => {
                        tokio::io::copy(&mut reader, &mut sink).await?;
                        sink.flush().await?;
                    }
                    None => {
                        reader.read_to_end(&mut buf).await?;
                    }
                }
            }
            Ok::<_, std::io::Error>(buf)
        };
        let read_stderr = async move {
            let mut buf = Vec::new();
            if let Some(mut reader) = stderr_reader {
                reader.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };

        let (written, stdout, stderr) = tokio::join!(write, read_stdout, read_stderr);
        written.map_err(|e| LifecycleError::transient("exec stdin", e.to_string()))?;
        let stdout = stdout.map_err(|e| LifecycleError::transient("exec stdout", e.to_string()))?;
        let stderr = stderr.map_err(|e| LifecycleError::transient("exec stderr", e.to_string()))?;

        let exit_code = match status {
            Some(status) => exit_code_from_status(status.await),
            None => 0,
        };
        attached
            .join()
            .await
            .map_err(|e| LifecycleError::transient("exec", e.to_string()))?;

        Ok(ExecOutput {
            stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }
}

macro_rules! convert_list {
    ($self:ident, $ty:ty, $ns:expr, $op:expr, $convert:expr) => {
        $self
            .list_namespaced::<$ty>($ns, $op)
            .await?
            .iter()
            .map($convert)
            .collect()
    };
}

macro_rules! convert_get {
    ($self:ident, $ty:ty, $ns:expr, $name:expr, $op:expr, $convert:expr) => {
        $self
            .get_namespaced::<$ty>($ns, $name, $op)
            .await?
            .as_ref()
            .map($convert)
    };
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_resources(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<ResourceStatus>> {
        let op = format!("list {kind}");
        let op = op.as_str();
        let statuses = match kind {
            ResourceKind::Namespace => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                api.list(&ListParams::default())
                    .await
                    .map_err(|e| map_kube_error(op, e))?
                    .items
                    .iter()
                    .map(namespace_status)
                    .collect()
            }
            ResourceKind::Node => {
                let api: Api<Node> = Api::all(self.client.clone());
                api.list(&ListParams::default())
                    .await
                    .map_err(|e| map_kube_error(op, e))?
                    .items
                    .iter()
                    .map(node_status)
                    .collect()
            }
            ResourceKind::Pod => convert_list!(self, Pod, namespace, op, pod_status),
            ResourceKind::Deployment => {
                convert_list!(self, Deployment, namespace, op, deployment_status)
            }
            ResourceKind::StatefulSet => {
                convert_list!(self, StatefulSet, namespace, op, statefulset_status)
            }
            ResourceKind::Service => convert_list!(self, Service, namespace, op, service_status),
            ResourceKind::Endpoints => {
                convert_list!(self, Endpoints, namespace, op, endpoints_status)
            }
            ResourceKind::Job => convert_list!(self, Job, namespace, op, job_status),
            ResourceKind::CronJob => convert_list!(self, CronJob, namespace, op, cronjob_status),
            ResourceKind::Secret => convert_list!(self, Secret, namespace, op, secret_status),
            ResourceKind::PersistentVolumeClaim => {
                convert_list!(self, PersistentVolumeClaim, namespace, op, pvc_status)
            }
            ResourceKind::NetworkPolicy => {
                convert_list!(self, NetworkPolicy, namespace, op, base_status)
            }
            ResourceKind::Ingress => convert_list!(self, Ingress, namespace, op, ingress_status),
        };
        Ok(statuses)
    }

    async fn get_resource_status(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ResourceStatus>> {
        let op = format!("get {kind} {name}");
        let op = op.as_str();
        let status = match kind {
            ResourceKind::Namespace => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                api.get_opt(name)
                    .await
                    .map_err(|e| map_kube_error(op, e))?
                    .as_ref()
                    .map(namespace_status)
            }
            ResourceKind::Node => {
                let api: Api<Node> = Api::all(self.client.clone());
                api.get_opt(name)
                    .await
                    .map_err(|e| map_kube_error(op, e))?
                    .as_ref()
                    .map(node_status)
            }
            ResourceKind::Pod => convert_get!(self, Pod, namespace, name, op, pod_status),
            ResourceKind::Deployment => {
                convert_get!(self, Deployment, namespace, name, op, deployment_status)
            }
            ResourceKind::StatefulSet => {
                convert_get!(self, StatefulSet, namespace, name, op, statefulset_status)
            }
            ResourceKind::Service => {
                convert_get!(self, Service, namespace, name, op, service_status)
            }
            ResourceKind::Endpoints => {
                convert_get!(self, Endpoints, namespace, name, op, endpoints_status)
            }
            ResourceKind::Job => convert_get!(self, Job, namespace, name, op, job_status),
            ResourceKind::CronJob => {
                convert_get!(self, CronJob, namespace, name, op, cronjob_status)
            }
            ResourceKind::Secret => convert_get!(self, Secret, namespace, name, op, secret_status),
            ResourceKind::PersistentVolumeClaim => {
                convert_get!(self, PersistentVolumeClaim, namespace, name, op, pvc_status)
            }
            ResourceKind::NetworkPolicy => {
                convert_get!(self, NetworkPolicy, namespace, name, op, base_status)
            }
            ResourceKind::Ingress => {
                convert_get!(self, Ingress, namespace, name, op, ingress_status)
            }
        };
        Ok(status)
    }

    async fn exec_in_workload(
        &self,
        selector: &WorkloadSelector,
        command: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput> {
        let input = stdin.map(|bytes| Box::new(std::io::Cursor::new(bytes)) as ExecInput);
        self.attach(selector, command, input, None).await
    }

    async fn exec_streaming(
        &self,
        selector: &WorkloadSelector,
        command: &[String],
        input: Option<&Path>,
        output: Option<&Path>,
    ) -> Result<ExecOutput> {
        let input = match input {
            Some(path) => Some(Box::new(tokio::fs::File::open(path).await?) as ExecInput),
            None => None,
        };
        let sink = match output {
            Some(path) => Some(Box::new(tokio::fs::File::create(path).await?) as ExecSink),
            None => None,
        };
        self.attach(selector, command, input, sink).await
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch_scale(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(&format!("scale deployment {name}"), e))?;
        Ok(())
    }

    async fn delete_resource(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let op = format!("delete {kind} {name}");
        match kind {
            ResourceKind::Pod => self.delete_namespaced::<Pod>(namespace, name, &op).await,
            ResourceKind::Deployment => {
                self.delete_namespaced::<Deployment>(namespace, name, &op).await
            }
            ResourceKind::StatefulSet => {
                self.delete_namespaced::<StatefulSet>(namespace, name, &op).await
            }
            ResourceKind::Service => self.delete_namespaced::<Service>(namespace, name, &op).await,
            ResourceKind::Job => self.delete_namespaced::<Job>(namespace, name, &op).await,
            ResourceKind::CronJob => self.delete_namespaced::<CronJob>(namespace, name, &op).await,
            ResourceKind::Secret => self.delete_namespaced::<Secret>(namespace, name, &op).await,
            ResourceKind::PersistentVolumeClaim => {
                self.delete_namespaced::<PersistentVolumeClaim>(namespace, name, &op)
                    .await
            }
            ResourceKind::NetworkPolicy => {
                self.delete_namespaced::<NetworkPolicy>(namespace, name, &op)
                    .await
            }
            ResourceKind::Ingress => self.delete_namespaced::<Ingress>(namespace, name, &op).await,
            ResourceKind::Endpoints => {
                self.delete_namespaced::<Endpoints>(namespace, name, &op)
                    .await
            }
            ResourceKind::Namespace | ResourceKind::Node => Err(LifecycleError::Configuration(
                format!("{kind} is cluster-scoped; use delete_namespace"),
            )),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(map_kube_error(&format!("delete namespace {name}"), e)),
        }
    }
}

/// Classify a kube error into the lifecycle taxonomy.
fn map_kube_error(operation: &str, err: kube::Error) -> LifecycleError {
    match &err {
        kube::Error::Api(response) => match response.code {
            401 | 403 => LifecycleError::Configuration(format!(
                "{operation}: access denied: {}",
                response.message
            )),
            404 => LifecycleError::NotFound(format!("{operation}: {}", response.message)),
            409 | 429 | 500..=599 => LifecycleError::transient(operation, response.message.clone()),
            _ => LifecycleError::remote(operation, response.message.clone()),
        },
        kube::Error::HyperError(_) | kube::Error::Service(_) => {
            LifecycleError::transient(operation, err.to_string())
        }
        _ => LifecycleError::remote(operation, err.to_string()),
    }
}

/// Extract the process exit code from an exec status object.
fn exit_code_from_status(
    status: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Status>,
) -> i32 {
    let Some(status) = status else {
        return 0;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .and_then(|details| details.causes)
        .and_then(|causes| {
            causes
                .into_iter()
                .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
                .and_then(|cause| cause.message)
        })
        .and_then(|code| code.parse().ok())
        .unwrap_or(1)
}

fn conditions_map<'a>(
    conditions: impl Iterator<Item = (&'a String, &'a String)>,
) -> BTreeMap<String, String> {
    conditions
        .map(|(kind, status)| (kind.clone(), status.clone()))
        .collect()
}

fn base_status<K: Resource>(resource: &K) -> ResourceStatus {
    ResourceStatus {
        name: resource.meta().name.clone().unwrap_or_default(),
        namespace: resource.meta().namespace.clone(),
        labels: resource.meta().labels.clone().unwrap_or_default(),
        ..ResourceStatus::default()
    }
}

fn namespace_status(ns: &Namespace) -> ResourceStatus {
    let phase = ns.status.as_ref().and_then(|s| s.phase.clone());
    ResourceStatus {
        ready: phase.as_deref() == Some("Active"),
        phase,
        ..base_status(ns)
    }
}

fn node_status(node: &Node) -> ResourceStatus {
    let conditions = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|c| conditions_map(c.iter().map(|c| (&c.type_, &c.status))))
        .unwrap_or_default();
    let mut status = ResourceStatus {
        conditions,
        ..base_status(node)
    };
    status.ready = status.condition_true("Ready");
    status
}

fn pod_status(pod: &Pod) -> ResourceStatus {
    let pod_status = pod.status.as_ref();
    let conditions = pod_status
        .and_then(|s| s.conditions.as_ref())
        .map(|c| conditions_map(c.iter().map(|c| (&c.type_, &c.status))))
        .unwrap_or_default();
    let restart_count = pod_status
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .map(|c| u32::try_from(c.restart_count).unwrap_or(0))
                .sum()
        })
        .unwrap_or(0);
    let privileged = pod.spec.as_ref().is_some_and(|spec| {
        spec.containers.iter().any(|c| {
            c.security_context
                .as_ref()
                .and_then(|sc| sc.privileged)
                .unwrap_or(false)
        })
    });

    let mut status = ResourceStatus {
        phase: pod_status.and_then(|s| s.phase.clone()),
        conditions,
        restart_count,
        ..base_status(pod)
    };
    status.ready = status.condition_true("Ready");
    status
        .attributes
        .insert("privileged".into(), privileged.to_string());
    status
}

fn deployment_status(deployment: &Deployment) -> ResourceStatus {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    let conditions = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|c| conditions_map(c.iter().map(|c| (&c.type_, &c.status))))
        .unwrap_or_default();
    ResourceStatus {
        ready: ready >= desired,
        desired_replicas: Some(desired),
        ready_replicas: Some(ready),
        conditions,
        ..base_status(deployment)
    }
}

fn statefulset_status(set: &StatefulSet) -> ResourceStatus {
    let desired = set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = set
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ResourceStatus {
        ready: ready >= desired,
        desired_replicas: Some(desired),
        ready_replicas: Some(ready),
        ..base_status(set)
    }
}

fn service_status(service: &Service) -> ResourceStatus {
    let mut status = base_status(service);
    status.ready = true;
    if let Some(kind) = service.spec.as_ref().and_then(|s| s.type_.clone()) {
        status.attributes.insert("type".into(), kind);
    }
    status
}

fn endpoints_status(endpoints: &Endpoints) -> ResourceStatus {
    let ready_addresses: usize = endpoints
        .subsets
        .as_ref()
        .map(|subsets| {
            subsets
                .iter()
                .map(|s| s.addresses.as_ref().map_or(0, Vec::len))
                .sum()
        })
        .unwrap_or(0);
    let mut status = base_status(endpoints);
    status.ready = ready_addresses > 0;
    status
        .attributes
        .insert("endpoints".into(), ready_addresses.to_string());
    status
}

fn job_status(job: &Job) -> ResourceStatus {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|c| conditions_map(c.iter().map(|c| (&c.type_, &c.status))))
        .unwrap_or_default();
    let mut status = ResourceStatus {
        conditions,
        ..base_status(job)
    };
    status.ready = status.condition_true("Complete");
    status
}

fn cronjob_status(cronjob: &CronJob) -> ResourceStatus {
    let mut status = base_status(cronjob);
    if let Some(spec) = &cronjob.spec {
        status
            .attributes
            .insert("schedule".into(), spec.schedule.clone());
        status.ready = !spec.suspend.unwrap_or(false);
    }
    status
}

fn secret_status(secret: &Secret) -> ResourceStatus {
    let mut status = base_status(secret);
    status.ready = true;
    if let Some(kind) = &secret.type_ {
        status.attributes.insert("type".into(), kind.clone());
    }
    status
}

fn pvc_status(pvc: &PersistentVolumeClaim) -> ResourceStatus {
    let phase = pvc.status.as_ref().and_then(|s| s.phase.clone());
    ResourceStatus {
        ready: phase.as_deref() == Some("Bound"),
        phase,
        ..base_status(pvc)
    }
}

fn ingress_status(ingress: &Ingress) -> ResourceStatus {
    let tls = ingress
        .spec
        .as_ref()
        .and_then(|s| s.tls.as_ref())
        .is_some_and(|tls| !tls.is_empty());
    let mut status = base_status(ingress);
    status.ready = true;
    status.attributes.insert("tls".into(), tls.to_string());
    status
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
        ObjectMeta, Status, StatusCause, StatusDetails,
    };

    use super::*;

    #[test]
    fn test_exit_code_from_status() {
        assert_eq!(exit_code_from_status(None), 0);
        assert_eq!(
            exit_code_from_status(Some(Status {
                status: Some("Success".into()),
                ..Status::default()
            })),
            0
        );
        let failure = Status {
            status: Some("Failure".into()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".into()),
                    message: Some("2".into()),
                    ..StatusCause::default()
                }]),
                ..StatusDetails::default()
            }),
            ..Status::default()
        };
        assert_eq!(exit_code_from_status(Some(failure)), 2);
    }

    #[test]
    fn test_node_ready_condition() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("worker-1".into()),
                ..ObjectMeta::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![
                    NodeCondition {
                        type_: "Ready".into(),
                        status: "True".into(),
                        ..NodeCondition::default()
                    },
                    NodeCondition {
                        type_: "MemoryPressure".into(),
                        status: "False".into(),
                        ..NodeCondition::default()
                    },
                ]),
                ..NodeStatus::default()
            }),
            ..Node::default()
        };
        let status = node_status(&node);
        assert_eq!(status.name, "worker-1");
        assert!(status.ready);
        assert!(!status.condition_true("MemoryPressure"));
    }
}
