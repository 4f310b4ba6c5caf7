//! Shared state handed to every validator.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::report::{Category, CheckRecord, Severity};
use crate::clients::{ClusterClient, ExecOutput, ResourceKind, ResourceStatus};
use crate::config::{ValidationSettings, WorkloadRef};
use crate::error::{LifecycleError, Result};

/// What a single check concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    Pass(String),
    Fail(String),
    /// Fail with a list of offending items in the details.
    FailWith(String, String),
    Warn(String),
    Skip(String),
}

/// Read-only context for a validation run.
pub struct ValidationContext {
    pub cluster: Arc<dyn ClusterClient>,
    pub settings: ValidationSettings,
    /// Primary namespace of the deployed system.
    pub namespace: String,
}

impl ValidationContext {
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        settings: ValidationSettings,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            settings,
            namespace: namespace.into(),
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.settings.check_timeout()
    }

    /// Run one check under the per-check timeout and turn its outcome into a
    /// record. Errors become failures with the error text in the details.
    pub async fn check<F>(
        &self,
        category: Category,
        name: &'static str,
        severity: Severity,
        check: F,
    ) -> CheckRecord
    where
        F: Future<Output = Result<Finding>>,
    {
        let timeout = self.timeout();
        let outcome = tokio::time::timeout(timeout, check)
            .await
            .unwrap_or_else(|_| Err(LifecycleError::timeout(name, timeout)));

        let record = match outcome {
            Ok(Finding::Pass(message)) => CheckRecord::pass(category, name, severity, message),
            Ok(Finding::Fail(message)) => CheckRecord::fail(category, name, severity, message),
            Ok(Finding::FailWith(message, details)) => {
                CheckRecord::fail(category, name, severity, message).with_details(details)
            }
            Ok(Finding::Warn(message)) => CheckRecord::warn(category, name, severity, message),
            Ok(Finding::Skip(message)) => CheckRecord::skip(category, name, severity, message),
            Err(e) => CheckRecord::fail(category, name, severity, "check could not complete")
                .with_details(e.to_string()),
        };
        debug!(check = name, status = ?record.status, "Check finished");
        record
    }

    /// List resources in the primary namespace.
    pub async fn list(&self, kind: ResourceKind) -> Result<Vec<ResourceStatus>> {
        self.cluster
            .list_resources(kind, Some(&self.namespace))
            .await
    }

    /// Execute a command in a workload of the primary namespace.
    pub async fn exec(&self, workload: &WorkloadRef, command: &[&str]) -> Result<ExecOutput> {
        let selector = workload.in_namespace(&self.namespace);
        let command: Vec<String> = command.iter().map(ToString::to_string).collect();
        self.cluster.exec_in_workload(&selector, &command, None).await
    }
}

/// Summarize offending names for a failure's details.
pub fn name_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names.into_iter().collect::<Vec<_>>().join(", ")
}
