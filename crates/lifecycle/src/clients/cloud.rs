//! Cloud resource deletion.
//!
//! Deletion is initiated with the provider CLIs in their asynchronous
//! ("no wait") mode; the engine reports resources as initiated and never
//! polls for completion.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{CloudResourceNames, Provider};
use crate::error::{LifecycleError, Result};
use crate::teardown::TeardownPlan;

/// Cloud-provisioned resources, in deletion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudResource {
    ManagedCluster,
    ManagedDatabase,
    ManagedCache,
    MessageBroker,
    Networking,
}

impl CloudResource {
    /// Dependents go before the resources they depend on.
    pub const DELETION_ORDER: [Self; 5] = [
        Self::ManagedCluster,
        Self::ManagedDatabase,
        Self::ManagedCache,
        Self::MessageBroker,
        Self::Networking,
    ];

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::ManagedCluster => "managed Kubernetes cluster",
            Self::ManagedDatabase => "managed database",
            Self::ManagedCache => "managed cache",
            Self::MessageBroker => "message broker",
            Self::Networking => "networking",
        }
    }

    /// Name used when none is configured: `<environment>-<suffix>`.
    fn default_name(self, environment: &str) -> String {
        let suffix = match self {
            Self::ManagedCluster => "cluster",
            Self::ManagedDatabase => "db",
            Self::ManagedCache => "cache",
            Self::MessageBroker => "broker",
            Self::Networking => "network",
        };
        format!("{environment}-{suffix}")
    }

    fn configured_name(self, names: &CloudResourceNames) -> Option<&String> {
        match self {
            Self::ManagedCluster => names.cluster.as_ref(),
            Self::ManagedDatabase => names.database.as_ref(),
            Self::ManagedCache => names.cache.as_ref(),
            Self::MessageBroker => names.broker.as_ref(),
            Self::Networking => names.network.as_ref(),
        }
    }
}

impl std::fmt::Display for CloudResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Initiates deletion of cloud resources.
#[async_trait]
pub trait CloudTeardown: Send + Sync {
    /// Start deleting `resource`; returns a provider operation reference.
    async fn initiate_deletion(&self, resource: CloudResource, plan: &TeardownPlan)
        -> Result<String>;
}

/// `CloudTeardown` backed by the `aws`, `gcloud` and `az` CLIs.
pub struct ProviderCliTeardown {
    names: CloudResourceNames,
    call_timeout: Duration,
}

impl ProviderCliTeardown {
    #[must_use]
    pub fn new(names: CloudResourceNames, call_timeout: Duration) -> Self {
        Self {
            names,
            call_timeout,
        }
    }
}

/// Build the CLI invocation that starts deleting `resource`.
///
/// Returns the program followed by its arguments.
pub fn deletion_command(
    provider: Provider,
    resource: CloudResource,
    environment: &str,
    names: &CloudResourceNames,
) -> Result<Vec<String>> {
    let name = resource
        .configured_name(names)
        .cloned()
        .unwrap_or_else(|| resource.default_name(environment));

    let command: Vec<String> = match provider {
        Provider::K8s => {
            return Err(LifecycleError::Configuration(
                "the k8s provider has no cloud resources".into(),
            ));
        }
        Provider::Aws => {
            let mut args = match resource {
                CloudResource::ManagedCluster => {
                    vec!["aws", "eks", "delete-cluster", "--name", name.as_str()]
                }
                CloudResource::ManagedDatabase => vec![
                    "aws",
                    "rds",
                    "delete-db-instance",
                    "--db-instance-identifier",
                    name.as_str(),
                    "--skip-final-snapshot",
                ],
                CloudResource::ManagedCache => vec![
                    "aws",
                    "elasticache",
                    "delete-replication-group",
                    "--replication-group-id",
                    name.as_str(),
                ],
                CloudResource::MessageBroker => {
                    let Some(arn) = names.broker.as_deref() else {
                        return Err(LifecycleError::Configuration(
                            "teardown.cloud_resources.broker must hold the MSK cluster ARN".into(),
                        ));
                    };
                    vec!["aws", "kafka", "delete-cluster", "--cluster-arn", arn]
                }
                CloudResource::Networking => {
                    vec!["aws", "cloudformation", "delete-stack", "--stack-name", name.as_str()]
                }
            }
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
            if let Some(region) = &names.region {
                args.extend(["--region".to_string(), region.clone()]);
            }
            args
        }
        Provider::Gcp => {
            let Some(project) = names.project.as_deref() else {
                return Err(LifecycleError::Configuration(
                    "teardown.cloud_resources.project is required for gcp".into(),
                ));
            };
            let region = names.region.as_deref().unwrap_or("us-central1");
            let args = match resource {
                CloudResource::ManagedCluster => vec![
                    "gcloud", "container", "clusters", "delete", name.as_str(), "--region", region,
                    "--async",
                ],
                CloudResource::ManagedDatabase => {
                    vec!["gcloud", "sql", "instances", "delete", name.as_str(), "--async"]
                }
                CloudResource::ManagedCache => vec![
                    "gcloud",
                    "redis",
                    "instances",
                    "delete",
                    name.as_str(),
                    "--region",
                    region,
                    "--async",
                ],
                CloudResource::MessageBroker => vec![
                    "gcloud",
                    "managed-kafka",
                    "clusters",
                    "delete",
                    name.as_str(),
                    "--location",
                    region,
                    "--async",
                ],
                CloudResource::Networking => {
                    vec!["gcloud", "compute", "networks", "delete", name.as_str()]
                }
            };
            let mut args: Vec<String> = args.into_iter().map(String::from).collect();
            args.extend([
                "--project".to_string(),
                project.to_string(),
                "--quiet".to_string(),
            ]);
            args
        }
        Provider::Azure => {
            let group = names
                .resource_group
                .clone()
                .unwrap_or_else(|| format!("{environment}-rg"));
            let args = match resource {
                CloudResource::ManagedCluster => {
                    vec!["az", "aks", "delete", "--name", name.as_str(), "--yes", "--no-wait"]
                }
                CloudResource::ManagedDatabase => vec![
                    "az",
                    "postgres",
                    "flexible-server",
                    "delete",
                    "--name",
                    name.as_str(),
                    "--yes",
                ],
                CloudResource::ManagedCache => {
                    vec!["az", "redis", "delete", "--name", name.as_str(), "--yes"]
                }
                CloudResource::MessageBroker => vec![
                    "az", "eventhubs", "namespace", "delete", "--name", name.as_str(), "--no-wait",
                ],
                CloudResource::Networking => {
                    vec!["az", "network", "vnet", "delete", "--name", name.as_str()]
                }
            };
            let mut args: Vec<String> = args.into_iter().map(String::from).collect();
            args.extend(["--resource-group".to_string(), group]);
            args
        }
    };
    Ok(command)
}

#[async_trait]
impl CloudTeardown for ProviderCliTeardown {
    async fn initiate_deletion(
        &self,
        resource: CloudResource,
        plan: &TeardownPlan,
    ) -> Result<String> {
        let command = deletion_command(plan.provider, resource, &plan.environment, &self.names)?;
        let Some((program, args)) = command.split_first() else {
            return Err(LifecycleError::Configuration("empty deletion command".into()));
        };
        let operation = format!("delete {resource}");
        debug!(program, ?args, "Initiating cloud deletion");

        let output = tokio::time::timeout(
            self.call_timeout,
            Command::new(program).args(args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| LifecycleError::timeout(&operation, self.call_timeout))?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LifecycleError::Configuration(format!("{program} CLI not found in PATH"))
            } else {
                LifecycleError::Io(e)
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LifecycleError::remote(operation, stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(resource = %resource, provider = %plan.provider, "Cloud deletion initiated");
        Ok(if stdout.is_empty() {
            format!("{program} {resource} deletion initiated")
        } else {
            stdout
        })
    }
}
