//! Teardown report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{StepStatus, TeardownScope, TeardownState, TransitionRecord};
use crate::clients::CloudResource;
use crate::config::Provider;
use crate::exit::ExitSignal;
use crate::validation::report::truncate;

/// Final outcome of a teardown run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownOutcome {
    Completed,
    CompletedWithWarnings,
    CompletedWithErrors,
    /// Stopped before any destructive step.
    Aborted,
    /// Cancelled after destructive steps had started.
    Interrupted,
}

impl TeardownOutcome {
    #[must_use]
    pub fn exit_signal(self) -> ExitSignal {
        match self {
            Self::Completed | Self::CompletedWithWarnings => ExitSignal::Success,
            Self::CompletedWithErrors => ExitSignal::ImportantFailure,
            Self::Aborted | Self::Interrupted => ExitSignal::Aborted,
        }
    }
}

/// One action taken (or skipped) within a state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub state: TeardownState,
    pub name: String,
    pub status: StepStatus,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudDeletionStatus {
    /// Deletion was requested; the provider completes it asynchronously.
    Initiated,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudDeletionRecord {
    pub resource: CloudResource,
    pub status: CloudDeletionStatus,
    /// Provider operation reference or error text.
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownReport {
    pub environment: String,
    pub provider: Provider,
    pub scope: TeardownScope,
    pub dry_run: bool,
    pub force: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Last state reached.
    pub final_state: TeardownState,
    pub transitions: Vec<TransitionRecord>,
    pub steps: Vec<StepRecord>,
    pub cloud_deletion: Vec<CloudDeletionRecord>,
    pub outcome: TeardownOutcome,
    /// Why the run was aborted or interrupted.
    pub reason: Option<String>,
    pub advisories: Vec<String>,
}

impl TeardownReport {
    #[must_use]
    pub fn exit_signal(&self) -> ExitSignal {
        self.outcome.exit_signal()
    }

    /// States entered, in order.
    #[must_use]
    pub fn states(&self) -> Vec<TeardownState> {
        let mut states = vec![TeardownState::Requested];
        states.extend(self.transitions.iter().map(|t| t.to));
        states
    }

    #[must_use]
    pub fn steps_in(&self, state: TeardownState) -> Vec<&StepRecord> {
        self.steps.iter().filter(|s| s.state == state).collect()
    }

    /// Print a summary of the teardown report.
    pub fn print_summary(&self) {
        println!();
        println!("╔══════════════════════════════════════════════════════════════════╗");
        println!("║                     PLATFORM TEARDOWN REPORT                     ║");
        println!("╠══════════════════════════════════════════════════════════════════╣");
        println!("║ Environment: {:<52}║", truncate(&self.environment, 52));
        println!("║ Provider:    {:<52}║", self.provider.to_string());
        println!(
            "║ Mode:        {:<52}║",
            if self.dry_run { "dry run" } else { "live" }
        );

        println!("╠══════════════════════════════════════════════════════════════════╣");
        for step in &self.steps {
            let icon = match step.status {
                StepStatus::Ok => "✅",
                StepStatus::Fail => "❌",
                StepStatus::Warn => "⚠️ ",
                StepStatus::Skipped => "⏭️ ",
            };
            println!(
                "║ {icon} {:<26} {:<35}║",
                truncate(&step.name, 26),
                truncate(&step.message, 35)
            );
        }

        if !self.cloud_deletion.is_empty() {
            println!("╠══════════════════════════════════════════════════════════════════╣");
            for record in &self.cloud_deletion {
                println!(
                    "║ {:<20} {:<43}║",
                    record.resource.description(),
                    format!("{:?}", record.status).to_lowercase()
                );
            }
        }

        println!("╠══════════════════════════════════════════════════════════════════╣");
        let outcome = match self.outcome {
            TeardownOutcome::Completed => "✅ TEARDOWN COMPLETED".to_string(),
            TeardownOutcome::CompletedWithWarnings => {
                "⚠️  TEARDOWN COMPLETED WITH WARNINGS".to_string()
            }
            TeardownOutcome::CompletedWithErrors => "❌ TEARDOWN COMPLETED WITH ERRORS".to_string(),
            TeardownOutcome::Aborted => "⏹️  TEARDOWN ABORTED".to_string(),
            TeardownOutcome::Interrupted => {
                format!("⏹️  TEARDOWN INTERRUPTED AT {}", self.final_state)
            }
        };
        println!("║ {:<64}║", truncate(&outcome, 64));
        if let Some(reason) = &self.reason {
            println!("║ {:<64}║", truncate(reason, 64));
        }
        for advisory in &self.advisories {
            println!("║ ℹ {:<62}║", truncate(advisory, 62));
        }
        println!("╚══════════════════════════════════════════════════════════════════╝");
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_exit_codes() {
        let codes = [
            TeardownOutcome::Completed,
            TeardownOutcome::CompletedWithWarnings,
            TeardownOutcome::CompletedWithErrors,
            TeardownOutcome::Aborted,
            TeardownOutcome::Interrupted,
        ]
        .map(|o| o.exit_signal().code());
        assert_eq!(codes, [0, 0, 2, 3, 3]);
    }

    #[test]
    fn test_outcome_serializes_snake_case() {
        let json = serde_json::to_string(&TeardownOutcome::CompletedWithWarnings).unwrap();
        assert_eq!(json, "\"completed_with_warnings\"");
    }
}
