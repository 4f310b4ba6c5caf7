//! Process exit signals.
//!
//! Automation callers (schedulers, CI pipelines) use these codes to decide
//! whether to halt a broader pipeline.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorClass, LifecycleError};

/// Outcome of an orchestrator run, mapped to a process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitSignal {
    /// Fully healthy / succeeded.
    Success,
    /// At least one critical check failed.
    CriticalFailure,
    /// Only important checks failed, or a destructive run completed with errors.
    ImportantFailure,
    /// Aborted by the operator or cancelled.
    Aborted,
    /// The operation itself could not run (configuration, integrity, remote).
    Error,
}

impl ExitSignal {
    /// Numeric process exit code.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::CriticalFailure => 1,
            Self::ImportantFailure => 2,
            Self::Aborted => 3,
            Self::Error => 4,
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Signal for an operation that returned an error instead of a report.
    #[must_use]
    pub fn for_error(error: &LifecycleError) -> Self {
        match error.class() {
            ErrorClass::ConfirmationDeclined => Self::Aborted,
            _ => Self::Error,
        }
    }
}

impl From<ExitSignal> for std::process::ExitCode {
    fn from(signal: ExitSignal) -> Self {
        Self::from(signal.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let codes = [
            ExitSignal::Success,
            ExitSignal::CriticalFailure,
            ExitSignal::ImportantFailure,
            ExitSignal::Aborted,
            ExitSignal::Error,
        ]
        .map(ExitSignal::code);
        let mut sorted = codes.to_vec();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
        assert_eq!(ExitSignal::Success.code(), 0);
    }

    #[test]
    fn test_error_signals() {
        let cancelled = LifecycleError::Cancelled {
            step: "upload".into(),
        };
        assert_eq!(ExitSignal::for_error(&cancelled), ExitSignal::Aborted);
        let integrity = LifecycleError::Integrity("checksum mismatch".into());
        assert_eq!(ExitSignal::for_error(&integrity).code(), 4);
    }
}
