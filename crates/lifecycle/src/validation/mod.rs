//! Platform validation.
//!
//! Runs the validators in a fixed order against the cluster and the data
//! services, aggregates their check records into a [`ValidationReport`] and
//! decides overall health.

pub mod checks;
pub mod context;
pub mod report;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use checks::{default_validators, Validator};
pub use context::{Finding, ValidationContext};
pub use report::{
    AbortReason, Category, CategoryResult, CheckCounts, CheckRecord, CheckStatus, Severity,
    ValidationReport,
};

use crate::clients::ClusterClient;
use crate::config::LifecycleConfig;

/// Options for a single validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Leave out the Database and Network categories.
    pub fast_mode: bool,
    /// Stop issuing validators after a critical failure.
    pub stop_on_critical: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            fast_mode: false,
            stop_on_critical: true,
        }
    }
}

/// Runs validators in order and builds the report.
pub struct ValidationOrchestrator {
    context: ValidationContext,
    environment: String,
    validators: Vec<Box<dyn Validator>>,
}

impl ValidationOrchestrator {
    /// Orchestrator with the standard validator set.
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterClient>, config: &LifecycleConfig) -> Self {
        Self::with_validators(cluster, config, default_validators())
    }

    #[must_use]
    pub fn with_validators(
        cluster: Arc<dyn ClusterClient>,
        config: &LifecycleConfig,
        validators: Vec<Box<dyn Validator>>,
    ) -> Self {
        Self {
            context: ValidationContext::new(
                cluster,
                config.validation.clone(),
                config.namespace.clone(),
            ),
            environment: config.environment.clone(),
            validators,
        }
    }

    /// Categories a run will execute, in order.
    #[must_use]
    pub fn plan(fast_mode: bool) -> Vec<Category> {
        Category::ORDER
            .into_iter()
            .filter(|c| !(fast_mode && c.is_expensive()))
            .collect()
    }

    /// Run validation. Cancellation is observed between validators.
    pub async fn run(
        &self,
        options: ValidationOptions,
        cancel: &CancellationToken,
    ) -> ValidationReport {
        let plan = Self::plan(options.fast_mode);
        info!(
            environment = %self.environment,
            namespace = %self.context.namespace,
            fast_mode = options.fast_mode,
            categories = plan.len(),
            "Starting validation"
        );

        let mut results = Vec::with_capacity(plan.len());
        let mut aborted = None;
        let mut not_run = Vec::new();

        for (index, category) in plan.iter().copied().enumerate() {
            if cancel.is_cancelled() {
                warn!(next = %category, "Validation cancelled");
                aborted = Some(AbortReason::Cancelled);
                not_run.extend_from_slice(&plan[index..]);
                break;
            }

            let checks = match self.validators.iter().find(|v| v.category() == category) {
                Some(validator) => validator.run(&self.context).await,
                None => vec![CheckRecord::skip(
                    category,
                    "validator",
                    Severity::Advisory,
                    "no validator registered",
                )],
            };
            let result = CategoryResult::new(category, checks);
            info!(
                category = %category,
                healthy = result.healthy,
                passed = result.counts.passed,
                failed = result.counts.failed,
                warnings = result.counts.warnings,
                "Category validated"
            );

            let critical = result.has_critical_failure();
            results.push(result);

            if critical && (category == Category::Prerequisites || options.stop_on_critical) {
                warn!(category = %category, "Critical failure, stopping validation");
                aborted = Some(AbortReason::CriticalFailure { category });
                not_run.extend_from_slice(&plan[index + 1..]);
                break;
            }
        }

        let report = ValidationReport::new(
            self.environment.clone(),
            options.fast_mode,
            results,
            not_run,
            aborted,
        );
        info!(
            healthy = report.healthy,
            total = report.counts.total,
            failed = report.counts.failed,
            "Validation finished"
        );
        report
    }
}
