//! Error types for lifecycle operations.

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;

/// Broad classification of a failure, used by orchestrators to decide what
/// happens next (retry, abort, downgrade to a warning).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retryable: connection reset, timeout while the remote is still reachable.
    TransientRemote,
    /// Missing prerequisite, bad credentials, invalid request. Fatal.
    Configuration,
    /// Checksum mismatch or corrupted artifact. Fatal for the operation.
    Integrity,
    /// The operator declined a confirmation gate. A normal early exit.
    ConfirmationDeclined,
    /// A best-effort step did not fully succeed.
    PartialFailure,
}

/// Errors that can occur during validation, backup, restore and teardown.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Remote call failed in a way that may succeed on retry.
    #[error("{operation}: transient remote error: {message}")]
    TransientRemote { operation: String, message: String },

    /// Invalid or missing configuration, credentials or prerequisites.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Artifact integrity could not be established.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Operator did not give the required confirmation.
    #[error("Confirmation declined: {0}")]
    ConfirmationDeclined(String),

    /// Best-effort step fell short; the caller proceeded.
    #[error("{step} partially failed: {message}")]
    PartialFailure { step: String, message: String },

    /// Remote call returned a non-retryable error.
    #[error("{operation} failed: {message}")]
    Remote { operation: String, message: String },

    /// Resource or object not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation exceeded its deadline.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Caller requested cancellation before the next step started.
    #[error("Cancelled before {step}")]
    Cancelled { step: String },

    /// Creating a backup failed. No Completed record was written.
    #[error("Backup {backup_id} failed: {source}")]
    BackupFailed {
        backup_id: String,
        #[source]
        source: Box<LifecycleError>,
    },

    /// Restoring a backup failed.
    #[error("Restore of backup {backup_id} failed: {source}")]
    RestoreFailed {
        backup_id: String,
        #[source]
        source: Box<LifecycleError>,
    },

    /// Point-in-time recovery was requested but cannot be performed.
    #[error("Point-in-time recovery unavailable for backup {backup_id}: {reason}")]
    PitrUnavailable { backup_id: String, reason: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LifecycleError {
    /// Build a transient remote error.
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientRemote {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Build a non-retryable remote error.
    pub fn remote(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Build a timeout error from a duration.
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds: after.as_secs(),
        }
    }

    /// Classify the error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TransientRemote { .. } | Self::Timeout { .. } => ErrorClass::TransientRemote,
            Self::Integrity(_) => ErrorClass::Integrity,
            Self::ConfirmationDeclined(_) | Self::Cancelled { .. } => {
                ErrorClass::ConfirmationDeclined
            }
            Self::PartialFailure { .. } => ErrorClass::PartialFailure,
            Self::BackupFailed { source, .. } | Self::RestoreFailed { source, .. } => {
                source.class()
            }
            Self::Configuration(_)
            | Self::Remote { .. }
            | Self::NotFound(_)
            | Self::PitrUnavailable { .. }
            | Self::Serialization(_)
            | Self::Io(_) => ErrorClass::Configuration,
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Backup and restore wrappers are never retryable: they are surfaced to
    /// the caller as-is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientRemote { .. } | Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            LifecycleError::transient("list pods", "connection reset").class(),
            ErrorClass::TransientRemote
        );
        assert_eq!(
            LifecycleError::Integrity("checksum mismatch".into()).class(),
            ErrorClass::Integrity
        );
        assert_eq!(
            LifecycleError::ConfirmationDeclined("no input".into()).class(),
            ErrorClass::ConfirmationDeclined
        );
    }

    #[test]
    fn test_wrapped_errors_keep_cause_class_but_never_retry() {
        let err = LifecycleError::RestoreFailed {
            backup_id: "orders-1".into(),
            source: Box::new(LifecycleError::Integrity("checksum mismatch".into())),
        };
        assert_eq!(err.class(), ErrorClass::Integrity);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("orders-1"));
        assert!(err.to_string().contains("checksum mismatch"));

        let timeout = LifecycleError::BackupFailed {
            backup_id: "orders-2".into(),
            source: Box::new(LifecycleError::timeout(
                "pg_dump",
                std::time::Duration::from_secs(30),
            )),
        };
        assert!(!timeout.is_retryable());
    }
}
