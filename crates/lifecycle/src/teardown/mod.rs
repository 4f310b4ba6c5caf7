//! Confirmation-gated teardown.
//!
//! The orchestrator walks `Requested → Confirmed → Draining →
//! DeletingClusterResources → DeletingCloudResources → CleaningLocalState →
//! Done`. Nothing destructive happens before confirmation. Once draining has
//! started, individual failures are recorded and the sequence continues so a
//! partial teardown never leaves the operator guessing what is left.

pub mod confirm;
pub mod report;
pub mod state;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use confirm::{ConfirmationPrompt, DialoguerPrompt, ScriptedPrompt};
pub use report::{
    CloudDeletionRecord, CloudDeletionStatus, StepRecord, TeardownOutcome, TeardownReport,
};
pub use state::{StepStatus, TeardownPlan, TeardownScope, TeardownState, TransitionRecord};

use crate::clients::{ClusterClient, CloudResource, CloudTeardown, ResourceKind};
use crate::config::{TeardownSettings, BACKUP_STORE_DIR};
use crate::error::{LifecycleError, Result};

/// Namespaces a teardown never deletes.
pub const PROTECTED_NAMESPACES: [&str; 4] =
    ["kube-system", "kube-public", "kube-node-lease", "default"];

/// Phrase required before tearing down a production environment.
pub const PRODUCTION_PHRASE: &str = "DELETE PRODUCTION";

const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Runs teardown plans.
pub struct TeardownOrchestrator {
    cluster: Arc<dyn ClusterClient>,
    cloud: Arc<dyn CloudTeardown>,
    prompt: Arc<dyn ConfirmationPrompt>,
    state_dir: PathBuf,
    protected_paths: Vec<PathBuf>,
    drain_grace: Duration,
}

/// Mutable bookkeeping for one run.
struct Run {
    report: TeardownReport,
}

impl Run {
    fn step(
        &mut self,
        state: TeardownState,
        name: impl Into<String>,
        status: StepStatus,
        message: impl Into<String>,
    ) {
        let record = StepRecord {
            state,
            name: name.into(),
            status,
            message: message.into(),
        };
        let (step, message) = (&record.name, &record.message);
        match status {
            StepStatus::Fail => warn!(?state, %step, %message, "Teardown step failed"),
            StepStatus::Warn => warn!(?state, %step, %message, "Teardown step incomplete"),
            StepStatus::Ok | StepStatus::Skipped => info!(?state, %step, %message, "Teardown step"),
        }
        self.report.steps.push(record);
    }

    /// Worst step status recorded in a state.
    fn state_status(&self, state: TeardownState) -> StepStatus {
        let statuses: Vec<_> = self
            .report
            .steps
            .iter()
            .filter(|s| s.state == state)
            .map(|s| s.status)
            .collect();
        if statuses.contains(&StepStatus::Fail) {
            StepStatus::Fail
        } else if statuses.contains(&StepStatus::Warn) {
            StepStatus::Warn
        } else if !statuses.is_empty() && statuses.iter().all(|s| *s == StepStatus::Skipped) {
            StepStatus::Skipped
        } else {
            StepStatus::Ok
        }
    }

    fn transition(&mut self, to: TeardownState, status: StepStatus, message: impl Into<String>) {
        let record = TransitionRecord {
            from: self.report.final_state,
            to,
            status,
            message: message.into(),
            at: Utc::now(),
        };
        info!(
            from = ?record.from,
            to = ?record.to,
            status = ?record.status,
            message = %record.message,
            "Teardown transition"
        );
        self.report.final_state = to;
        self.report.transitions.push(record);
    }

    /// Leave the current state for `to`, summarising the current state's steps.
    fn advance(&mut self, to: TeardownState) {
        let from = self.report.final_state;
        let status = self.state_status(from);
        let message = match status {
            StepStatus::Ok => format!("{from} finished"),
            StepStatus::Warn => format!("{from} finished with warnings"),
            StepStatus::Fail => format!("{from} finished with errors"),
            StepStatus::Skipped => format!("{from} skipped"),
        };
        self.transition(to, status, message);
    }

    fn finish(mut self, outcome: TeardownOutcome, reason: Option<String>) -> TeardownReport {
        self.report.outcome = outcome;
        self.report.reason = reason;
        self.report.finished_at = Utc::now();
        self.report
    }
}

impl TeardownOrchestrator {
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        cloud: Arc<dyn CloudTeardown>,
        prompt: Arc<dyn ConfirmationPrompt>,
        settings: &TeardownSettings,
    ) -> Self {
        Self {
            cluster,
            cloud,
            prompt,
            state_dir: settings.state_dir(),
            protected_paths: vec![settings.backup_store_root()],
            drain_grace: settings.drain_grace(),
        }
    }

    /// Never remove `path`, anything inside it or anything containing it
    /// while cleaning local state.
    #[must_use]
    pub fn with_protected_path(mut self, path: PathBuf) -> Self {
        self.protected_paths.push(path);
        self
    }

    /// Reject plans that target protected or empty namespaces, or whose
    /// environment label does not name a single local state entry.
    pub fn validate_plan(plan: &TeardownPlan) -> Result<()> {
        let environment = plan.environment.as_str();
        let mut components = Path::new(environment).components();
        let plain = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if environment.trim().is_empty() || !plain || environment.contains(['/', '\\']) {
            return Err(LifecycleError::Configuration(format!(
                "Environment label {environment:?} must be a plain name"
            )));
        }
        if environment == BACKUP_STORE_DIR {
            return Err(LifecycleError::Configuration(format!(
                "Environment label {environment:?} is reserved for the backup store"
            )));
        }
        for namespace in plan.namespaces() {
            if namespace.trim().is_empty() {
                return Err(LifecycleError::Configuration(
                    "Teardown namespace must not be empty".into(),
                ));
            }
            if PROTECTED_NAMESPACES.contains(&namespace) {
                return Err(LifecycleError::Configuration(format!(
                    "Refusing to tear down protected namespace {namespace}"
                )));
            }
        }
        Ok(())
    }

    /// Run a teardown plan. Returns `Err` only for invalid plans; everything
    /// that happens after validation is described by the report.
    pub async fn run(
        &self,
        plan: &TeardownPlan,
        cancel: &CancellationToken,
    ) -> Result<TeardownReport> {
        Self::validate_plan(plan)?;
        info!(
            environment = %plan.environment,
            provider = %plan.provider,
            scope = ?plan.scope,
            namespaces = ?plan.namespaces(),
            dry_run = plan.dry_run,
            "Teardown requested"
        );

        let now = Utc::now();
        let mut run = Run {
            report: TeardownReport {
                environment: plan.environment.clone(),
                provider: plan.provider,
                scope: plan.scope,
                dry_run: plan.dry_run,
                force: plan.force,
                started_at: now,
                finished_at: now,
                final_state: TeardownState::Requested,
                transitions: Vec::new(),
                steps: Vec::new(),
                cloud_deletion: Vec::new(),
                outcome: TeardownOutcome::Aborted,
                reason: None,
                advisories: Vec::new(),
            },
        };

        if cancel.is_cancelled() {
            return Ok(abort(run, "cancelled before confirmation"));
        }
        match self.confirm(plan).await {
            Ok(message) => run.transition(TeardownState::Confirmed, StepStatus::Ok, message),
            Err(e) => return Ok(abort(run, &e.to_string())),
        }

        loop {
            let next = run.report.final_state.next();
            if next == TeardownState::Done {
                run.advance(TeardownState::Done);
                break;
            }
            if cancel.is_cancelled() {
                if run.report.final_state.is_destructive() {
                    let reason = format!(
                        "cancelled after {}; no further destructive steps were taken",
                        run.report.final_state
                    );
                    warn!(state = ?run.report.final_state, "Teardown interrupted");
                    run.report.advisories.push(
                        "Teardown was interrupted; re-run it to remove what is left".into(),
                    );
                    return Ok(run.finish(TeardownOutcome::Interrupted, Some(reason)));
                }
                return Ok(abort(run, "cancelled before draining"));
            }

            run.advance(next);
            match next {
                TeardownState::Draining => self.drain(plan, &mut run).await,
                TeardownState::DeletingClusterResources => {
                    self.delete_namespaces(plan, &mut run).await;
                }
                TeardownState::DeletingCloudResources => {
                    self.delete_cloud_resources(plan, &mut run).await;
                }
                TeardownState::CleaningLocalState => self.clean_local_state(plan, &mut run).await,
                _ => {}
            }
        }

        let steps = &run.report.steps;
        let outcome = if steps.iter().any(|s| s.status == StepStatus::Fail) {
            TeardownOutcome::CompletedWithErrors
        } else if steps.iter().any(|s| s.status == StepStatus::Warn) {
            TeardownOutcome::CompletedWithWarnings
        } else {
            TeardownOutcome::Completed
        };
        info!(outcome = ?outcome, environment = %plan.environment, "Teardown finished");
        Ok(run.finish(outcome, None))
    }

    /// Confirmation gates. Returns the transition message, or
    /// `ConfirmationDeclined`.
    async fn confirm(&self, plan: &TeardownPlan) -> Result<String> {
        if plan.force {
            warn!(
                audit = true,
                environment = %plan.environment,
                production = plan.is_production(),
                "Confirmation gates bypassed with --force"
            );
            return Ok("confirmation bypassed with force".into());
        }
        if plan.is_production() {
            let answer = self
                .prompt
                .ask(&format!(
                    "Type '{PRODUCTION_PHRASE}' to tear down production environment '{}'",
                    plan.environment
                ))
                .await?;
            if answer.as_deref() != Some(PRODUCTION_PHRASE) {
                return Err(LifecycleError::ConfirmationDeclined(format!(
                    "production phrase not confirmed ({})",
                    describe_answer(answer.as_deref())
                )));
            }
        }

        let answer = self
            .prompt
            .ask(&format!(
                "Type 'yes' to delete {} in environment '{}'",
                plan.namespaces().join(", "),
                plan.environment
            ))
            .await?;
        if answer.as_deref() != Some("yes") {
            return Err(LifecycleError::ConfirmationDeclined(format!(
                "teardown not confirmed ({})",
                describe_answer(answer.as_deref())
            )));
        }
        Ok("confirmed by operator".into())
    }

    /// Scale deployments to zero, remove jobs and wait for pods to go away.
    async fn drain(&self, plan: &TeardownPlan, run: &mut Run) {
        const STATE: TeardownState = TeardownState::Draining;

        for namespace in plan.namespaces() {
            let deployments = match self
                .cluster
                .list_resources(ResourceKind::Deployment, Some(namespace))
                .await
            {
                Ok(items) => items,
                Err(e) => {
                    let name = format!("list deployments {namespace}");
                    run.step(STATE, name, StepStatus::Warn, e.to_string());
                    Vec::new()
                }
            };
            let mut jobs = Vec::new();
            for kind in [ResourceKind::Job, ResourceKind::CronJob] {
                match self.cluster.list_resources(kind, Some(namespace)).await {
                    Ok(items) => jobs.extend(items.into_iter().map(|item| (kind, item.name))),
                    Err(e) => run.step(
                        STATE,
                        format!("list {kind} {namespace}"),
                        StepStatus::Warn,
                        e.to_string(),
                    ),
                }
            }

            if plan.dry_run {
                run.step(
                    STATE,
                    format!("drain {namespace}"),
                    StepStatus::Skipped,
                    format!(
                        "dry run: would scale {} deployments and delete {} jobs",
                        deployments.len(),
                        jobs.len()
                    ),
                );
                continue;
            }

            let scaled = join_all(
                deployments
                    .iter()
                    .map(|d| self.cluster.scale_deployment(namespace, &d.name, 0)),
            )
            .await;
            let deleted = join_all(
                jobs.iter()
                    .map(|(kind, name)| self.cluster.delete_resource(*kind, namespace, name)),
            )
            .await;

            let mut failures = 0;
            for (deployment, result) in deployments.iter().zip(scaled) {
                if let Err(e) = result {
                    failures += 1;
                    run.step(
                        STATE,
                        format!("scale {namespace}/{}", deployment.name),
                        StepStatus::Warn,
                        e.to_string(),
                    );
                }
            }
            for ((kind, name), result) in jobs.iter().zip(deleted) {
                if let Err(e) = result {
                    failures += 1;
                    run.step(
                        STATE,
                        format!("delete {kind} {namespace}/{name}"),
                        StepStatus::Warn,
                        e.to_string(),
                    );
                }
            }
            let attempted = deployments.len() + jobs.len();
            run.step(
                STATE,
                format!("drain {namespace}"),
                StepStatus::Ok,
                format!(
                    "{} of {attempted} workloads stopped",
                    attempted - failures
                ),
            );
        }

        if !plan.dry_run {
            self.wait_for_pods(plan, run).await;
        }
    }

    async fn wait_for_pods(&self, plan: &TeardownPlan, run: &mut Run) {
        const STATE: TeardownState = TeardownState::Draining;
        let deadline = Instant::now() + self.drain_grace;
        loop {
            let mut remaining = 0;
            for namespace in plan.namespaces() {
                match self
                    .cluster
                    .list_resources(ResourceKind::Pod, Some(namespace))
                    .await
                {
                    Ok(pods) => remaining += pods.len(),
                    Err(e) => {
                        run.step(STATE, "wait for pods", StepStatus::Warn, e.to_string());
                        return;
                    }
                }
            }
            if remaining == 0 {
                run.step(STATE, "wait for pods", StepStatus::Ok, "all pods terminated");
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                run.step(
                    STATE,
                    "wait for pods",
                    StepStatus::Warn,
                    format!(
                        "{remaining} pods still present after {}s grace period; continuing",
                        self.drain_grace.as_secs()
                    ),
                );
                return;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn delete_namespaces(&self, plan: &TeardownPlan, run: &mut Run) {
        const STATE: TeardownState = TeardownState::DeletingClusterResources;
        for namespace in plan.namespaces() {
            let name = format!("delete namespace {namespace}");
            if plan.dry_run {
                run.step(STATE, name, StepStatus::Skipped, "dry run");
                continue;
            }
            match self.cluster.delete_namespace(namespace).await {
                Ok(()) => run.step(STATE, name, StepStatus::Ok, "deletion requested"),
                Err(e) => run.step(STATE, name, StepStatus::Fail, e.to_string()),
            }
        }
    }

    async fn delete_cloud_resources(&self, plan: &TeardownPlan, run: &mut Run) {
        const STATE: TeardownState = TeardownState::DeletingCloudResources;
        if !plan.deletes_cloud_resources() {
            let reason = if plan.provider.has_cloud_resources() {
                "scope is cluster-only".to_string()
            } else {
                format!("provider {} has no cloud resources", plan.provider)
            };
            run.step(STATE, "cloud resources", StepStatus::Skipped, reason);
            return;
        }

        for resource in CloudResource::DELETION_ORDER {
            let name = format!("delete {resource}");
            if plan.dry_run {
                run.step(STATE, name, StepStatus::Skipped, "dry run");
                run.report.cloud_deletion.push(CloudDeletionRecord {
                    resource,
                    status: CloudDeletionStatus::Skipped,
                    detail: "dry run".into(),
                });
                continue;
            }
            match self.cloud.initiate_deletion(resource, plan).await {
                Ok(reference) => {
                    run.step(STATE, name, StepStatus::Ok, "initiated");
                    run.report.cloud_deletion.push(CloudDeletionRecord {
                        resource,
                        status: CloudDeletionStatus::Initiated,
                        detail: reference,
                    });
                }
                Err(e) => {
                    run.step(STATE, name, StepStatus::Fail, e.to_string());
                    run.report.cloud_deletion.push(CloudDeletionRecord {
                        resource,
                        status: CloudDeletionStatus::Failed,
                        detail: e.to_string(),
                    });
                }
            }
        }
        if run
            .report
            .cloud_deletion
            .iter()
            .any(|r| r.status == CloudDeletionStatus::Initiated)
        {
            run.report.advisories.push(
                "Cloud resource deletion was initiated; \
                 resources may take several minutes to disappear"
                    .into(),
            );
        }
    }

    async fn clean_local_state(&self, plan: &TeardownPlan, run: &mut Run) {
        const STATE: TeardownState = TeardownState::CleaningLocalState;
        let paths = local_state_paths(&self.state_dir, &plan.environment);
        for path in paths {
            let name = format!("remove {}", path.display());
            if let Err(e) = self.check_removable(&path) {
                run.step(STATE, name, StepStatus::Fail, e.to_string());
                continue;
            }
            let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
            if !exists {
                run.step(STATE, name, StepStatus::Skipped, "not present");
                continue;
            }
            if plan.dry_run {
                run.step(STATE, name, StepStatus::Skipped, "dry run");
                continue;
            }
            let removed = if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match removed {
                Ok(()) => run.step(STATE, name, StepStatus::Ok, "removed"),
                Err(e) => run.step(STATE, name, StepStatus::Warn, e.to_string()),
            }
        }
    }

    /// A cleanup path must sit strictly inside the state directory and must
    /// not overlap a protected path.
    fn check_removable(&self, path: &Path) -> Result<()> {
        let path = absolute(path);
        let state_dir = absolute(&self.state_dir);
        if path == state_dir || !path.starts_with(&state_dir) {
            return Err(LifecycleError::Configuration(format!(
                "refusing to remove {}: outside {}",
                path.display(),
                state_dir.display()
            )));
        }
        for protected in self.protected_paths.iter().map(|p| absolute(p)) {
            if protected.starts_with(&path) || path.starts_with(&protected) {
                return Err(LifecycleError::Configuration(format!(
                    "refusing to remove {}: overlaps protected {}",
                    path.display(),
                    protected.display()
                )));
            }
        }
        Ok(())
    }
}

/// Lexically normalised absolute form of `path`.
fn absolute(path: &Path) -> PathBuf {
    let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut normalised = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalised.pop();
            }
            other => normalised.push(other),
        }
    }
    normalised
}

/// Local state removed by a teardown of `environment`.
#[must_use]
pub fn local_state_paths(state_dir: &Path, environment: &str) -> [PathBuf; 2] {
    [
        state_dir.join(environment),
        state_dir.join(format!("{environment}.kubeconfig")),
    ]
}

fn abort(mut run: Run, reason: &str) -> TeardownReport {
    warn!(reason, "Teardown aborted; no destructive steps were taken");
    run.transition(TeardownState::Aborted, StepStatus::Skipped, reason);
    run.finish(TeardownOutcome::Aborted, Some(reason.to_string()))
}

fn describe_answer(answer: Option<&str>) -> &'static str {
    match answer {
        None => "no input",
        Some(_) => "input did not match",
    }
}
