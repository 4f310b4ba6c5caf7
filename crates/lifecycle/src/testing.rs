//! Test doubles shared by the unit tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::clients::{
    ClusterClient, ExecOutput, MemoryObjectStore, ObjectInfo, ObjectStorageClient, ResourceKind,
    ResourceStatus, StoredObject, WorkloadSelector,
};
use crate::config::ValidationSettings;
use crate::error::{LifecycleError, Result};
use crate::validation::ValidationContext;

type ExecHandler = Arc<dyn Fn(&[String], Option<&[u8]>) -> Result<ExecOutput> + Send + Sync>;

/// A recorded exec call.
#[derive(Debug, Clone)]
pub struct ExecCall {
    pub selector: String,
    pub command: String,
    pub stdin: Option<Vec<u8>>,
}

#[derive(Default)]
struct FakeState {
    resources: BTreeMap<ResourceKind, Vec<ResourceStatus>>,
    exec_rules: Vec<(String, ExecHandler)>,
    exec_log: Vec<ExecCall>,
    mutations: Vec<String>,
    failing: Vec<String>,
    unreachable: bool,
}

/// In-memory cluster. Clones share state.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, kind: ResourceKind, status: ResourceStatus) {
        self.lock().resources.entry(kind).or_default().push(status);
    }

    /// Reply to commands containing `pattern`. Later rules win.
    pub fn on_exec(&self, pattern: &str, reply: Result<ExecOutput>) {
        let reply = reply.map_err(|e| e.to_string());
        self.on_exec_with(pattern, move |_, _| match &reply {
            Ok(output) => Ok(output.clone()),
            Err(message) => Err(LifecycleError::remote("exec", message.clone())),
        });
    }

    pub fn on_exec_with<F>(&self, pattern: &str, handler: F)
    where
        F: Fn(&[String], Option<&[u8]>) -> Result<ExecOutput> + Send + Sync + 'static,
    {
        self.lock()
            .exec_rules
            .push((pattern.to_string(), Arc::new(handler)));
    }

    /// Make mutating calls whose description starts with `prefix` fail.
    pub fn fail_on(&self, prefix: &str) {
        self.lock().failing.push(prefix.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn mutations(&self) -> Vec<String> {
        self.lock().mutations.clone()
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.lock().exec_log.clone()
    }

    /// Exec calls whose command contains `pattern`.
    pub fn exec_calls_matching(&self, pattern: &str) -> Vec<ExecCall> {
        self.exec_calls()
            .into_iter()
            .filter(|c| c.command.contains(pattern))
            .collect()
    }

    /// Validation context over this cluster with default settings.
    pub fn context(&self) -> ValidationContext {
        ValidationContext::new(
            Arc::new(self.clone()),
            ValidationSettings::default(),
            "platform",
        )
    }

    fn mutate(&self, description: String, apply: impl FnOnce(&mut FakeState)) -> Result<()> {
        let mut state = self.lock();
        if state.failing.iter().any(|p| description.starts_with(p.as_str())) {
            return Err(LifecycleError::remote(description, "injected failure"));
        }
        apply(&mut state);
        state.mutations.push(description);
        Ok(())
    }
}

fn in_namespace(status: &ResourceStatus, namespace: Option<&str>) -> bool {
    match namespace {
        Some(ns) => status.namespace.as_deref() == Some(ns),
        None => true,
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_resources(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<ResourceStatus>> {
        let state = self.lock();
        if state.unreachable {
            return Err(LifecycleError::transient(
                format!("list {kind}"),
                "connection refused",
            ));
        }
        Ok(state
            .resources
            .get(&kind)
            .map(|items| {
                items
                    .iter()
                    .filter(|s| kind.is_cluster_scoped() || in_namespace(s, namespace))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_resource_status(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ResourceStatus>> {
        Ok(self
            .list_resources(kind, namespace)
            .await?
            .into_iter()
            .find(|s| s.name == name))
    }

    async fn exec_in_workload(
        &self,
        selector: &WorkloadSelector,
        command: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput> {
        let joined = command.join(" ");
        let handler = {
            let mut state = self.lock();
            if state.unreachable {
                return Err(LifecycleError::transient("exec", "connection refused"));
            }
            state.exec_log.push(ExecCall {
                selector: selector.to_string(),
                command: joined.clone(),
                stdin: stdin.clone(),
            });
            state
                .exec_rules
                .iter()
                .rev()
                .find(|(pattern, _)| joined.contains(pattern.as_str()))
                .map(|(_, handler)| handler.clone())
        };
        match handler {
            Some(handler) => handler(command, stdin.as_deref()),
            None => Ok(ExecOutput {
                stdout: Vec::new(),
                stderr: format!(
                    "{}: command not found",
                    command.first().map_or("", String::as_str)
                ),
                exit_code: 127,
            }),
        }
    }

    async fn exec_streaming(
        &self,
        selector: &WorkloadSelector,
        command: &[String],
        input: Option<&Path>,
        output: Option<&Path>,
    ) -> Result<ExecOutput> {
        let stdin = match input {
            Some(path) => Some(tokio::fs::read(path).await?),
            None => None,
        };
        let mut result = self.exec_in_workload(selector, command, stdin).await?;
        if let Some(path) = output {
            tokio::fs::write(path, std::mem::take(&mut result.stdout)).await?;
        }
        Ok(result)
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        self.mutate(format!("scale {namespace}/{name}={replicas}"), |state| {
            if let Some(deployments) = state.resources.get_mut(&ResourceKind::Deployment) {
                for d in deployments
                    .iter_mut()
                    .filter(|d| d.name == name && d.namespace.as_deref() == Some(namespace))
                {
                    d.desired_replicas = Some(replicas);
                    d.ready_replicas = Some(replicas.min(d.ready_replicas.unwrap_or(0)));
                }
            }
            if replicas == 0 {
                if let Some(pods) = state.resources.get_mut(&ResourceKind::Pod) {
                    pods.retain(|p| {
                        !(p.namespace.as_deref() == Some(namespace)
                            && p.labels.get("app").map(String::as_str) == Some(name))
                    });
                }
            }
        })
    }

    async fn delete_resource(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        self.mutate(format!("delete {kind} {namespace}/{name}"), |state| {
            if let Some(items) = state.resources.get_mut(&kind) {
                items.retain(|s| !(s.name == name && s.namespace.as_deref() == Some(namespace)));
            }
        })
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.mutate(format!("delete namespace {name}"), |state| {
            for (kind, items) in &mut state.resources {
                if *kind == ResourceKind::Namespace {
                    items.retain(|s| s.name != name);
                } else if !kind.is_cluster_scoped() {
                    items.retain(|s| s.namespace.as_deref() != Some(name));
                }
            }
        })
    }
}

pub fn namespace(name: &str) -> ResourceStatus {
    ResourceStatus {
        name: name.into(),
        phase: Some("Active".into()),
        ready: true,
        ..ResourceStatus::default()
    }
}

pub fn node(name: &str, ready: bool) -> ResourceStatus {
    ResourceStatus {
        name: name.into(),
        ready,
        conditions: [(
            "Ready".to_string(),
            if ready { "True" } else { "False" }.to_string(),
        )]
        .into(),
        ..ResourceStatus::default()
    }
}

pub fn pod(namespace: &str, name: &str, phase: &str) -> ResourceStatus {
    let ready = phase == "Running";
    let app = name.rsplit_once('-').map_or(name, |(app, _)| app);
    ResourceStatus {
        name: name.into(),
        namespace: Some(namespace.into()),
        phase: Some(phase.into()),
        ready,
        conditions: [(
            "Ready".to_string(),
            if ready { "True" } else { "False" }.to_string(),
        )]
        .into(),
        labels: [("app".to_string(), app.to_string())].into(),
        ..ResourceStatus::default()
    }
}

pub fn deployment(namespace: &str, name: &str, desired: i32, ready: i32) -> ResourceStatus {
    ResourceStatus {
        name: name.into(),
        namespace: Some(namespace.into()),
        ready: ready >= desired,
        desired_replicas: Some(desired),
        ready_replicas: Some(ready),
        labels: [("app".to_string(), name.to_string())].into(),
        ..ResourceStatus::default()
    }
}

fn named(namespace: &str, name: &str, attributes: &[(&str, &str)]) -> ResourceStatus {
    ResourceStatus {
        name: name.into(),
        namespace: Some(namespace.into()),
        ready: true,
        attributes: attributes
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
        ..ResourceStatus::default()
    }
}

pub fn ok_output(stdout: &str) -> Result<ExecOutput> {
    Ok(ExecOutput {
        stdout: stdout.as_bytes().to_vec(),
        stderr: String::new(),
        exit_code: 0,
    })
}

/// A healthy platform: 3 ready nodes, 15 running system pods and a complete
/// `platform` namespace with working data services.
pub fn healthy_cluster() -> FakeCluster {
    let cluster = FakeCluster::new();
    cluster.add(ResourceKind::Namespace, namespace("platform"));
    cluster.add(ResourceKind::Namespace, namespace("kube-system"));
    for i in 1..=3 {
        cluster.add(ResourceKind::Node, node(&format!("worker-{i}"), true));
    }
    for i in 0..15 {
        cluster.add(ResourceKind::Pod, pod("kube-system", &format!("system-{i}"), "Running"));
    }

    cluster.add(ResourceKind::Deployment, deployment("platform", "api", 2, 2));
    for (name, replicas) in [("postgres", 1), ("redis", 1), ("kafka", 3)] {
        let mut set = deployment("platform", name, replicas, replicas);
        set.labels = [("app".to_string(), name.to_string())].into();
        cluster.add(ResourceKind::StatefulSet, set);
    }
    for name in ["api-0", "api-1", "postgres-0", "redis-0", "kafka-0", "kafka-1", "kafka-2"] {
        cluster.add(ResourceKind::Pod, pod("platform", name, "Running"));
    }
    for name in ["api", "postgres", "redis", "kafka"] {
        cluster.add(ResourceKind::Service, named("platform", name, &[("type", "ClusterIP")]));
        cluster.add(ResourceKind::Endpoints, named("platform", name, &[("endpoints", "1")]));
    }
    cluster.add(
        ResourceKind::Secret,
        named("platform", "db-credentials", &[("type", "Opaque")]),
    );
    cluster.add(
        ResourceKind::Secret,
        named("platform", "platform-tls", &[("type", "kubernetes.io/tls")]),
    );
    let mut claim = named("platform", "data-postgres-0", &[]);
    claim.phase = Some("Bound".into());
    cluster.add(ResourceKind::PersistentVolumeClaim, claim);
    cluster.add(ResourceKind::NetworkPolicy, named("platform", "default-deny", &[]));
    cluster.add(ResourceKind::Ingress, named("platform", "api", &[("tls", "true")]));

    cluster.on_exec("pg_isready", ok_output("/var/run/postgresql:5432 - accepting connections"));
    cluster.on_exec("SELECT 1", ok_output("1"));
    cluster.on_exec("extname = 'timescaledb'", ok_output("2.14.2"));
    cluster.on_exec("redis-cli ping", ok_output("PONG"));
    cluster.on_exec(
        "cluster info",
        ok_output("cluster_state:ok\ncluster_slots_assigned:16384\ncluster_known_nodes:6"),
    );
    cluster.on_exec(
        "kafka-broker-api-versions",
        ok_output(
            "kafka-0:9092 (id: 0 rack: null) -> (\n\tProduce(0): 0 to 9\n)\n\
             kafka-1:9092 (id: 1 rack: null) -> (\n)\n\
             kafka-2:9092 (id: 2 rack: null) -> (\n)",
        ),
    );
    cluster.on_exec("nslookup", ok_output("Name: kubernetes.default.svc.cluster.local"));
    cluster.on_exec("nc -z", ok_output(""));
    cluster
}

pub const WAL_BASE: &str = "000000010000000000000003";
pub const FAKE_DUMP: &[u8] =
    b"PGDMP\x01\x0e\x00fake custom-format dump of orders with several tables";
/// Stand-in for a `pg_basebackup` tar stream.
pub const FAKE_BASE: &[u8] =
    b"backup_label\0START WAL LOCATION: 0/3000028\0PG_VERSION\x0016\0base/1/1259\0";

/// Healthy cluster whose database workload answers dump, restore and WAL
/// commands.
pub fn postgres_cluster() -> FakeCluster {
    let cluster = healthy_cluster();
    cluster.on_exec("pg_dump", Ok(ExecOutput {
        stdout: FAKE_DUMP.to_vec(),
        stderr: String::new(),
        exit_code: 0,
    }));
    cluster.on_exec("pg_basebackup", Ok(ExecOutput {
        stdout: FAKE_BASE.to_vec(),
        stderr: String::new(),
        exit_code: 0,
    }));
    cluster.on_exec("pg_walfile_name", ok_output(WAL_BASE));
    cluster.on_exec(
        "ls -1",
        ok_output(
            "000000010000000000000001\n000000010000000000000002\n000000010000000000000003\n\
             000000010000000000000004\n000000010000000000000005\narchive_status",
        ),
    );
    cluster.on_exec_with("tar -cf", |command, _| {
        Ok(ExecOutput {
            stdout: format!("wal-archive:{}", command.join(" ")).into_bytes(),
            stderr: String::new(),
            exit_code: 0,
        })
    });
    cluster.on_exec(
        "tar -xvf",
        ok_output(
            "000000010000000000000003\n000000010000000000000004\n000000010000000000000005",
        ),
    );
    cluster.on_exec("-mindepth 1 -delete", ok_output(""));
    cluster.on_exec(
        "tar -tf",
        ok_output("backup_label\nPG_VERSION\nbase/1/1259\nglobal/pg_control\npg_wal/"),
    );
    cluster.on_exec("pg_restore", ok_output(""));
    cluster.on_exec("information_schema.tables", ok_output("12"));
    cluster.on_exec("recovery.signal", ok_output(""));
    cluster.on_exec("pg_ctl", ok_output("server stopped"));
    cluster.on_exec("createdb", ok_output(""));
    cluster.on_exec("dropdb", ok_output(""));
    cluster
}

/// Object store wrapper that injects failures.
pub struct FaultyStore {
    pub inner: MemoryObjectStore,
    fail_puts_containing: Mutex<Option<String>>,
    transient_failures: AtomicU32,
    corrupt_reads_containing: Mutex<Option<String>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryObjectStore::new("test"),
            fail_puts_containing: Mutex::new(None),
            transient_failures: AtomicU32::new(0),
            corrupt_reads_containing: Mutex::new(None),
        }
    }

    /// Fail every put whose key contains `pattern`.
    pub fn fail_puts(&self, pattern: &str) {
        *self
            .fail_puts_containing
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(pattern.to_string());
    }

    /// Fail the next `count` operations with a transient error.
    pub fn transient_failures(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Flip the last byte of every object read back whose key contains `pattern`.
    pub fn corrupt_reads(&self, pattern: &str) {
        *self
            .corrupt_reads_containing
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(pattern.to_string());
    }

    fn take_transient(&self, operation: &str) -> Result<()> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(LifecycleError::transient(operation, "503 Slow Down"));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorageClient for FaultyStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<()> {
        self.take_transient("put")?;
        let failing = self
            .fail_puts_containing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if failing.is_some_and(|p| key.contains(&p)) {
            return Err(LifecycleError::remote("put", "access denied"));
        }
        self.inner.put(key, bytes, metadata).await
    }

    async fn get(&self, key: &str) -> Result<StoredObject> {
        self.take_transient("get")?;
        let mut object = self.inner.get(key).await?;
        let corrupting = self
            .corrupt_reads_containing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if corrupting.is_some_and(|p| key.contains(&p)) {
            if let Some(byte) = object.bytes.last_mut() {
                *byte ^= 0xff;
            }
        }
        Ok(object)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    fn uri(&self, key: &str) -> String {
        self.inner.uri(key)
    }
}
