//! CLI subcommands and the options they share.

pub mod backup;
pub mod teardown;
pub mod validate;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use lifecycle::clients::{ClusterClient, KubeClusterClient, LocalObjectStore, ObjectStorageClient};
use lifecycle::config::{LifecycleConfig, Provider};

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, env = "LIFECYCLE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Environment label (e.g. staging, production).
    #[arg(short, long, global = true, env = "LIFECYCLE_ENVIRONMENT")]
    pub environment: Option<String>,

    /// Primary namespace of the deployed system.
    #[arg(short, long, global = true, env = "LIFECYCLE_NAMESPACE")]
    pub namespace: Option<String>,

    /// Infrastructure provider (k8s, aws, gcp, azure).
    #[arg(long, global = true, env = "LIFECYCLE_PROVIDER")]
    pub provider: Option<Provider>,

    /// Path to kubeconfig file (in-cluster config when unset).
    #[arg(long, global = true, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Root directory of the backup object store.
    #[arg(long, global = true, env = "LIFECYCLE_STORAGE_ROOT")]
    pub storage_root: Option<PathBuf>,

    /// Output reports as JSON.
    #[arg(long, global = true, default_value = "false")]
    pub json: bool,
}

impl GlobalArgs {
    /// Load the configuration file and apply flag overrides.
    pub fn load_config(&self) -> Result<LifecycleConfig> {
        let mut config = LifecycleConfig::load(self.config.as_deref())?;
        if let Some(environment) = &self.environment {
            config.environment.clone_from(environment);
        }
        if let Some(namespace) = &self.namespace {
            config.namespace.clone_from(namespace);
        }
        if let Some(provider) = self.provider {
            config.provider = provider;
        }
        debug!(
            environment = %config.environment,
            namespace = %config.namespace,
            provider = %config.provider,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Connect to the cluster.
    pub async fn cluster(&self) -> Result<Arc<dyn ClusterClient>> {
        let client = match &self.kubeconfig {
            Some(path) => KubeClusterClient::from_kubeconfig(path).await?,
            None => KubeClusterClient::try_default().await?,
        };
        Ok(Arc::new(client))
    }

    /// Root directory of the local backup object store.
    pub fn storage_root(&self, config: &LifecycleConfig) -> PathBuf {
        self.storage_root
            .clone()
            .unwrap_or_else(|| config.teardown.backup_store_root())
    }

    /// Object store holding backup artifacts and the catalog.
    pub fn store(&self, config: &LifecycleConfig) -> Arc<dyn ObjectStorageClient> {
        let root = self.storage_root(config);
        debug!(root = %root.display(), "Using local object store");
        Arc::new(LocalObjectStore::new(root))
    }

    /// Print a report as pretty JSON.
    pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
        let text = serde_json::to_string_pretty(value).context("Failed to serialize report")?;
        println!("{text}");
        Ok(())
    }
}

/// Token cancelled on the first Ctrl-C. Orchestrators observe it between steps.
pub fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            child.cancel();
        }
    });
    token
}
