//! Validate command - platform health check.

use anyhow::Result;
use clap::Args;
use tracing::info;

use lifecycle::validation::{ValidationOptions, ValidationOrchestrator};
use lifecycle::ExitSignal;

use super::{cancel_on_interrupt, GlobalArgs};
use crate::ui;

/// Validate the deployed platform.
#[derive(Args, Debug)]
pub struct ValidateCommand {
    /// Skip the Database and Network categories.
    #[arg(long, default_value = "false")]
    fast: bool,

    /// Keep running validators after a critical failure.
    #[arg(long, default_value = "false")]
    no_stop_on_critical: bool,
}

impl ValidateCommand {
    /// Run the validation command.
    pub async fn run(&self, globals: &GlobalArgs) -> Result<ExitSignal> {
        let config = globals.load_config()?;
        let options = ValidationOptions {
            fast_mode: self.fast,
            stop_on_critical: config.validation.stop_on_critical && !self.no_stop_on_critical,
        };

        if !globals.json {
            ui::print_banner(&config.environment);
            ui::print_section("Platform Validation");
            ui::print_kv("Environment", &config.environment);
            ui::print_kv("Namespace", &config.namespace);
            ui::print_kv("Mode", if self.fast { "fast" } else { "full" });
            for category in ValidationOrchestrator::plan(self.fast) {
                ui::print_list_item(category.description());
            }
            println!();
        }

        let cluster = globals.cluster().await?;
        let orchestrator = ValidationOrchestrator::new(cluster, &config);
        let report = orchestrator.run(options, &cancel_on_interrupt()).await;
        info!(
            healthy = report.healthy,
            failed = report.counts.failed,
            warnings = report.counts.warnings,
            "Validation finished"
        );

        if globals.json {
            GlobalArgs::print_json(&report)?;
        } else {
            report.print_summary();
        }
        Ok(report.exit_signal())
    }
}
