//! Teardown states, plan and transition records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{is_production, Provider};

/// Teardown state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownState {
    /// Plan accepted, waiting for confirmation.
    Requested,
    /// Operator confirmed (or force was given).
    Confirmed,
    /// Scaling workloads down and removing jobs.
    Draining,
    /// Deleting namespaces.
    DeletingClusterResources,
    /// Initiating deletion of provider-managed resources.
    DeletingCloudResources,
    /// Removing local state and kubeconfig.
    CleaningLocalState,
    /// Sequence finished.
    Done,
    /// Stopped before anything destructive happened.
    Aborted,
}

impl TeardownState {
    /// Get the next state in the sequence.
    #[must_use]
    pub fn next(self) -> Self {
        match self {
            Self::Requested => Self::Confirmed,
            Self::Confirmed => Self::Draining,
            Self::Draining => Self::DeletingClusterResources,
            Self::DeletingClusterResources => Self::DeletingCloudResources,
            Self::DeletingCloudResources => Self::CleaningLocalState,
            Self::CleaningLocalState | Self::Done => Self::Done,
            Self::Aborted => Self::Aborted,
        }
    }

    /// Get a human-readable description of the state.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Requested => "Awaiting confirmation",
            Self::Confirmed => "Confirmed",
            Self::Draining => "Draining workloads",
            Self::DeletingClusterResources => "Deleting cluster resources",
            Self::DeletingCloudResources => "Deleting cloud resources",
            Self::CleaningLocalState => "Cleaning local state",
            Self::Done => "Done",
            Self::Aborted => "Aborted",
        }
    }

    /// Get the state number for progress display.
    #[must_use]
    pub fn step_number(self) -> u8 {
        match self {
            Self::Requested | Self::Aborted => 0,
            Self::Confirmed => 1,
            Self::Draining => 2,
            Self::DeletingClusterResources => 3,
            Self::DeletingCloudResources => 4,
            Self::CleaningLocalState => 5,
            Self::Done => 6,
        }
    }

    /// Total number of steps.
    pub const TOTAL_STEPS: u8 = 6;

    /// Whether the state mutates anything.
    #[must_use]
    pub fn is_destructive(self) -> bool {
        matches!(
            self,
            Self::Draining
                | Self::DeletingClusterResources
                | Self::DeletingCloudResources
                | Self::CleaningLocalState
        )
    }
}

impl std::fmt::Display for TeardownState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// What a teardown removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TeardownScope {
    /// Namespaces and local state only.
    #[default]
    ClusterOnly,
    /// Also provider-managed resources.
    Full,
}

/// A requested teardown. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownPlan {
    pub environment: String,
    pub provider: Provider,
    pub scope: TeardownScope,
    /// Primary namespace.
    pub namespace: String,
    pub additional_namespaces: Vec<String>,
    /// Skip confirmation gates.
    pub force: bool,
    /// Walk the states without mutating anything.
    pub dry_run: bool,
}

impl TeardownPlan {
    #[must_use]
    pub fn is_production(&self) -> bool {
        is_production(&self.environment)
    }

    /// Namespaces to drain and delete, primary first.
    #[must_use]
    pub fn namespaces(&self) -> Vec<&str> {
        let mut namespaces = vec![self.namespace.as_str()];
        for ns in &self.additional_namespaces {
            if !namespaces.contains(&ns.as_str()) {
                namespaces.push(ns);
            }
        }
        namespaces
    }

    /// Whether provider-managed resources are deleted.
    #[must_use]
    pub fn deletes_cloud_resources(&self) -> bool {
        self.scope == TeardownScope::Full && self.provider.has_cloud_resources()
    }
}

/// Status of a transition or of a step within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Warn,
    Fail,
    Skipped,
}

/// One state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: TeardownState,
    pub to: TeardownState,
    pub status: StepStatus,
    pub message: String,
    pub at: DateTime<Utc>,
}
