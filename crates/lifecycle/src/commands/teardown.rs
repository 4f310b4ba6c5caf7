//! Teardown command - confirmation-gated environment removal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, ValueEnum};

use lifecycle::clients::ProviderCliTeardown;
use lifecycle::teardown::{
    DialoguerPrompt, StepStatus, TeardownOrchestrator, TeardownOutcome, TeardownPlan,
    TeardownScope,
};
use lifecycle::ExitSignal;

use super::{cancel_on_interrupt, GlobalArgs};
use crate::ui;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ScopeArg {
    /// Namespaces and local state only.
    ClusterOnly,
    /// Also provider-managed resources.
    Full,
}

impl From<ScopeArg> for TeardownScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::ClusterOnly => Self::ClusterOnly,
            ScopeArg::Full => Self::Full,
        }
    }
}

/// Tear down an environment.
#[derive(Args, Debug)]
pub struct TeardownCommand {
    /// What to remove.
    #[arg(long, value_enum, default_value = "cluster-only")]
    scope: ScopeArg,

    /// Skip confirmation prompts. Logged for audit.
    #[arg(long, default_value = "false")]
    force: bool,

    /// Walk every state without changing anything.
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Extra namespace to delete (repeatable).
    #[arg(long = "additional-namespace")]
    additional_namespaces: Vec<String>,
}

impl TeardownCommand {
    /// Run the teardown command.
    pub async fn run(&self, globals: &GlobalArgs) -> Result<ExitSignal> {
        let config = globals.load_config()?;
        let mut additional_namespaces = config.teardown.additional_namespaces.clone();
        additional_namespaces.extend(self.additional_namespaces.iter().cloned());
        let plan = TeardownPlan {
            environment: config.environment.clone(),
            provider: config.provider,
            scope: self.scope.into(),
            namespace: config.namespace.clone(),
            additional_namespaces,
            force: self.force,
            dry_run: self.dry_run,
        };
        TeardownOrchestrator::validate_plan(&plan)?;

        if !globals.json {
            ui::print_banner(&plan.environment);
            ui::print_section("Platform Teardown");
            ui::print_kv("Environment", &plan.environment);
            ui::print_kv("Provider", &plan.provider.to_string());
            ui::print_kv("Namespaces", &plan.namespaces().join(", "));
            ui::print_kv(
                "Cloud resources",
                if plan.deletes_cloud_resources() { "deleted" } else { "kept" },
            );
            if plan.dry_run {
                ui::print_info("Dry run: nothing will be changed");
            } else if plan.is_production() {
                ui::print_warning("This is a PRODUCTION environment");
            }
            println!();
        }

        let cloud = ProviderCliTeardown::new(
            config.teardown.cloud_resources.clone(),
            Duration::from_secs(config.teardown.cloud_call_timeout_secs),
        );
        let orchestrator = TeardownOrchestrator::new(
            globals.cluster().await?,
            Arc::new(cloud),
            Arc::new(DialoguerPrompt),
            &config.teardown,
        )
        .with_protected_path(globals.storage_root(&config));
        let report = orchestrator.run(&plan, &cancel_on_interrupt()).await?;

        if globals.json {
            GlobalArgs::print_json(&report)?;
        } else {
            println!();
            for transition in &report.transitions {
                ui::print_teardown_state(transition.to, transition.status);
            }
            report.print_summary();
            match report.outcome {
                TeardownOutcome::Aborted | TeardownOutcome::Interrupted => {
                    ui::print_warning("No further destructive steps were taken");
                }
                TeardownOutcome::CompletedWithErrors => {
                    for step in report.steps.iter().filter(|s| s.status == StepStatus::Fail) {
                        ui::print_error(&format!("{}: {}", step.name, step.message));
                    }
                }
                TeardownOutcome::Completed | TeardownOutcome::CompletedWithWarnings => {}
            }
        }
        Ok(report.exit_signal())
    }
}
