//! Environment-scoped configuration.
//!
//! Configuration is read from an optional TOML file; every section has
//! defaults so an empty file (or no file) is valid. The CLI layers flag and
//! environment overrides on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backup::Compression;
use crate::clients::WorkloadSelector;
use crate::error::{LifecycleError, Result};

/// Infrastructure provider hosting the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Plain Kubernetes; nothing provisioned outside the cluster.
    #[default]
    K8s,
    Aws,
    Gcp,
    Azure,
}

impl Provider {
    /// Whether the provider owns cloud resources outside the cluster.
    #[must_use]
    pub fn has_cloud_resources(self) -> bool {
        !matches!(self, Self::K8s)
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::K8s => write!(f, "k8s"),
            Self::Aws => write!(f, "aws"),
            Self::Gcp => write!(f, "gcp"),
            Self::Azure => write!(f, "azure"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "k8s" | "kubernetes" => Ok(Self::K8s),
            "aws" => Ok(Self::Aws),
            "gcp" => Ok(Self::Gcp),
            "azure" => Ok(Self::Azure),
            _ => Err(LifecycleError::Configuration(format!(
                "Unknown provider: {s}. Supported: k8s, aws, gcp, azure"
            ))),
        }
    }
}

/// A workload referenced by label selector, resolved against a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRef {
    /// Label selector, e.g. `app=postgres`.
    pub label_selector: String,
    /// Container to exec into (first container when unset).
    #[serde(default)]
    pub container: Option<String>,
}

impl WorkloadRef {
    fn labelled(selector: &str) -> Self {
        Self {
            label_selector: selector.to_string(),
            container: None,
        }
    }

    /// Resolve into a selector for the given namespace.
    #[must_use]
    pub fn in_namespace(&self, namespace: &str) -> WorkloadSelector {
        WorkloadSelector {
            namespace: namespace.to_string(),
            label_selector: self.label_selector.clone(),
            container: self.container.clone(),
        }
    }
}

/// Validation engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    /// Per-check timeout for remote calls.
    pub check_timeout_secs: u64,
    /// Stop issuing validators after a critical failure.
    pub stop_on_critical: bool,
    /// Namespace holding cluster system pods.
    pub system_namespace: String,
    /// Minimum number of nodes expected.
    pub min_nodes: usize,
    /// Deployments/StatefulSets that must exist in the namespace.
    pub expected_workloads: Vec<String>,
    /// Secrets that must exist in the namespace.
    pub required_secrets: Vec<String>,
    /// TLS secret serving ingress traffic.
    pub tls_secret: Option<String>,
    /// Container restarts above this count are reported.
    pub restart_threshold: u32,
    /// Relational / time-series store.
    pub postgres: WorkloadRef,
    /// Role used for database probes.
    pub database_user: String,
    /// Cache cluster.
    pub redis: WorkloadRef,
    /// Event-streaming cluster.
    pub kafka: WorkloadRef,
    /// Workload used as the source of network probes.
    pub probe: WorkloadRef,
    /// `host:port` of the database service as seen from workloads.
    pub database_endpoint: String,
    /// `host:port` of the cache service as seen from workloads.
    pub cache_endpoint: String,
    /// `host:port` of the broker bootstrap service, seen from inside the broker pod.
    pub kafka_bootstrap: String,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            check_timeout_secs: 10,
            stop_on_critical: true,
            system_namespace: "kube-system".into(),
            min_nodes: 3,
            expected_workloads: Vec::new(),
            required_secrets: Vec::new(),
            tls_secret: None,
            restart_threshold: 5,
            postgres: WorkloadRef::labelled("app=postgres"),
            database_user: "postgres".into(),
            redis: WorkloadRef::labelled("app=redis"),
            kafka: WorkloadRef::labelled("app=kafka"),
            probe: WorkloadRef::labelled("app=api"),
            database_endpoint: "postgres:5432".into(),
            cache_endpoint: "redis:6379".into(),
            kafka_bootstrap: "localhost:9092".into(),
        }
    }
}

impl ValidationSettings {
    #[must_use]
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

/// Backup and restore settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Database workload that runs dump/restore tooling.
    pub database_workload: WorkloadRef,
    /// Database role used by dump/restore tooling.
    pub database_user: String,
    /// Artifact compression.
    pub compression: Compression,
    /// Encrypt artifacts with AES-256-GCM.
    pub encrypt: bool,
    /// Environment variable holding the hex-encoded 32-byte encryption key.
    pub key_env: String,
    /// Take full backups as physical base backups and record the WAL
    /// segment they start from, so increments can be replayed onto them.
    /// Off, full backups are logical dumps without PITR.
    pub capture_wal_position: bool,
    /// Postgres data directory inside the database workload.
    pub data_dir: String,
    /// WAL directory inside the database workload.
    pub wal_dir: String,
    /// Directory WAL increments are staged into for replay.
    pub restore_wal_dir: String,
    /// Object key prefix for artifacts and catalog records.
    pub storage_prefix: String,
    /// Timeout for producing a dump.
    pub dump_timeout_secs: u64,
    /// Fixed part of the restore timeout.
    pub restore_base_timeout_secs: u64,
    /// Expected restore throughput used to scale the timeout with size.
    pub restore_throughput_bytes_per_sec: u64,
    /// Upper bound for any restore timeout.
    pub restore_max_timeout_secs: u64,
    /// How long to wait for the database to come back after PITR.
    pub ready_timeout_secs: u64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            database_workload: WorkloadRef::labelled("app=postgres"),
            database_user: "postgres".into(),
            compression: Compression::Gzip,
            encrypt: false,
            key_env: "LIFECYCLE_BACKUP_KEY".into(),
            capture_wal_position: true,
            data_dir: "/var/lib/postgresql/data".into(),
            wal_dir: "/var/lib/postgresql/data/pg_wal".into(),
            restore_wal_dir: "/var/lib/postgresql/wal_restore".into(),
            storage_prefix: "lifecycle".into(),
            dump_timeout_secs: 3600,
            restore_base_timeout_secs: 300,
            restore_throughput_bytes_per_sec: 50 * 1024 * 1024,
            restore_max_timeout_secs: 4 * 3600,
            ready_timeout_secs: 600,
        }
    }
}

impl BackupSettings {
    #[must_use]
    pub fn dump_timeout(&self) -> Duration {
        Duration::from_secs(self.dump_timeout_secs)
    }

    /// Restore timeout proportional to data size, bounded above.
    #[must_use]
    pub fn restore_timeout(&self, size_bytes: u64) -> Duration {
        let throughput = self.restore_throughput_bytes_per_sec.max(1);
        let secs = self
            .restore_base_timeout_secs
            .saturating_add(size_bytes / throughput);
        Duration::from_secs(secs.min(self.restore_max_timeout_secs))
    }

    #[must_use]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

/// Names of cloud-provisioned resources. Unset names derive from the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudResourceNames {
    pub region: Option<String>,
    /// GCP project.
    pub project: Option<String>,
    /// Azure resource group.
    pub resource_group: Option<String>,
    pub cluster: Option<String>,
    pub database: Option<String>,
    pub cache: Option<String>,
    /// Broker identifier (an ARN on AWS).
    pub broker: Option<String>,
    pub network: Option<String>,
}

/// Directory under the state directory that holds the local backup store.
pub const BACKUP_STORE_DIR: &str = "backups";

/// Teardown settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TeardownSettings {
    /// Extra namespaces deleted with the primary one (monitoring, ingress).
    pub additional_namespaces: Vec<String>,
    /// Grace period for workloads to terminate while draining.
    pub drain_grace_secs: u64,
    /// Local state directory (defaults to `~/.lifecycle`).
    pub state_dir: Option<PathBuf>,
    /// Timeout for each cloud deletion call.
    pub cloud_call_timeout_secs: u64,
    pub cloud_resources: CloudResourceNames,
}

impl Default for TeardownSettings {
    fn default() -> Self {
        Self {
            additional_namespaces: Vec::new(),
            drain_grace_secs: 60,
            state_dir: None,
            cloud_call_timeout_secs: 120,
            cloud_resources: CloudResourceNames::default(),
        }
    }
}

impl TeardownSettings {
    #[must_use]
    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }

    /// Resolved local state directory.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".lifecycle")
        })
    }

    /// Default root of the local backup object store.
    #[must_use]
    pub fn backup_store_root(&self) -> PathBuf {
        self.state_dir().join(BACKUP_STORE_DIR)
    }
}

/// Full lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Environment label (e.g. "staging", "production").
    pub environment: String,
    /// Primary namespace of the deployed system.
    pub namespace: String,
    pub provider: Provider,
    pub validation: ValidationSettings,
    pub backup: BackupSettings,
    pub teardown: TeardownSettings,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            environment: "development".into(),
            namespace: "platform".into(),
            provider: Provider::default(),
            validation: ValidationSettings::default(),
            backup: BackupSettings::default(),
            teardown: TeardownSettings::default(),
        }
    }
}

impl LifecycleConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| LifecycleError::Configuration(format!("Invalid configuration: {e}")))
    }

    /// Load configuration from a file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|e| {
            LifecycleError::Configuration(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml(&text)
    }

    /// Whether this is a production environment.
    #[must_use]
    pub fn is_production(&self) -> bool {
        is_production(&self.environment)
    }
}

/// Production detection shared by config and teardown plans.
#[must_use]
pub fn is_production(environment: &str) -> bool {
    matches!(
        environment.to_ascii_lowercase().as_str(),
        "production" | "prod"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = LifecycleConfig::default();
        assert_eq!(config.provider, Provider::K8s);
        assert_eq!(config.validation.check_timeout(), Duration::from_secs(10));
        assert!(config.validation.stop_on_critical);
        assert_eq!(config.backup.compression, Compression::Gzip);
        assert!(!config.is_production());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = LifecycleConfig::from_toml(
            r#"
            environment = "production"
            namespace = "trading"
            provider = "aws"

            [validation]
            min_nodes = 5
            required_secrets = ["db-credentials"]

            [teardown]
            additional_namespaces = ["monitoring"]
            "#,
        )
        .unwrap();
        assert!(config.is_production());
        assert_eq!(config.provider, Provider::Aws);
        assert_eq!(config.validation.min_nodes, 5);
        assert_eq!(config.validation.system_namespace, "kube-system");
        assert_eq!(config.teardown.additional_namespaces, vec!["monitoring"]);
        assert_eq!(config.teardown.drain_grace_secs, 60);
    }

    #[test]
    fn test_invalid_toml_is_configuration_error() {
        let err = LifecycleConfig::from_toml("provider = \"heroku\"").unwrap_err();
        assert!(matches!(err, LifecycleError::Configuration(_)));
    }

    #[test]
    fn test_provider_parsing() {
        assert_eq!("AWS".parse::<Provider>().unwrap(), Provider::Aws);
        assert_eq!("kubernetes".parse::<Provider>().unwrap(), Provider::K8s);
        assert!("heroku".parse::<Provider>().is_err());
        assert!(!Provider::K8s.has_cloud_resources());
        assert!(Provider::Gcp.has_cloud_resources());
    }

    #[test]
    fn test_restore_timeout_scales_and_caps() {
        let settings = BackupSettings::default();
        let two_gib = 2 * 1024 * 1024 * 1024;
        assert_eq!(settings.restore_timeout(0), Duration::from_secs(300));
        assert_eq!(settings.restore_timeout(two_gib), Duration::from_secs(300 + 40));
        assert_eq!(
            settings.restore_timeout(u64::MAX),
            Duration::from_secs(settings.restore_max_timeout_secs)
        );
    }
}
