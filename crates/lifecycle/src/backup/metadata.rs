//! Backup catalog records and restore request/result types.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::LifecycleError;
use crate::exit::ExitSignal;
use crate::validation::{CheckRecord, CheckStatus, Severity};

/// Timestamp format embedded in backup ids.
const ID_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Longest identifier Postgres keeps without truncation.
const MAX_DATABASE_NAME_LEN: usize = 63;

static DATABASE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_$-]*$").expect("database name pattern")
});

/// Accept only plain database identifiers. Names end up in object keys and
/// on tool command lines, where separators or conninfo strings change meaning.
pub fn validate_database_name(name: &str) -> crate::error::Result<()> {
    if name.len() <= MAX_DATABASE_NAME_LEN && DATABASE_NAME.is_match(name) {
        Ok(())
    } else {
        Err(LifecycleError::Configuration(format!(
            "Invalid database name {name:?}: expected a Postgres identifier of at most \
             {MAX_DATABASE_NAME_LEN} characters"
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    /// Complete base: a physical base backup when WAL is captured, a logical
    /// dump otherwise.
    Full,
    /// Archived WAL segments since the latest full backup.
    Incremental,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

impl std::str::FromStr for BackupType {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "incremental" | "wal" => Ok(Self::Incremental),
            _ => Err(LifecycleError::Configuration(format!(
                "Unknown backup type: {s}. Supported: full, incremental"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl BackupStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Name used in catalog object keys.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artifact compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    #[default]
    Gzip,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Gzip => write!(f, "gzip"),
        }
    }
}

/// How an artifact's payload was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackupFormat {
    /// `pg_dump --format=custom` of one database.
    #[default]
    Logical,
    /// `pg_basebackup` tar of the whole data directory. The only base WAL can
    /// be replayed onto.
    Physical,
    /// Tar of archived WAL segments.
    WalArchive,
}

impl BackupFormat {
    /// Object key suffix before the codec's own.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Logical => ".dump",
            Self::Physical => ".base.tar",
            Self::WalArchive => ".wal.tar",
        }
    }
}

impl fmt::Display for BackupFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logical => write!(f, "logical"),
            Self::Physical => write!(f, "physical"),
            Self::WalArchive => write!(f, "wal archive"),
        }
    }
}

/// One backup as recorded in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_id: String,
    pub database: String,
    pub backup_type: BackupType,
    #[serde(default)]
    pub format: BackupFormat,
    pub status: BackupStatus,
    /// Size of the uncompressed dump.
    pub size_bytes: u64,
    /// Size of the stored artifact.
    pub artifact_bytes: u64,
    /// URI of the artifact in object storage.
    pub storage_location: String,
    pub storage_key: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// `sha256:<hex>` of the stored artifact.
    pub checksum: String,
    pub compression: Compression,
    pub encrypted: bool,
    /// WAL segment current when a physical base was started, or the newest
    /// segment included in an increment.
    pub wal_position: Option<String>,
    pub parent_backup_id: Option<String>,
    pub error: Option<String>,
}

impl BackupMetadata {
    /// Generate a backup id: `<database>-<UTC timestamp>-<random suffix>`.
    #[must_use]
    pub fn new_id(database: &str, at: DateTime<Utc>) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{database}-{}-{}", at.format(ID_TIMESTAMP_FORMAT), &suffix[..8])
    }

    /// Database name embedded in a backup id.
    #[must_use]
    pub fn database_from_id(backup_id: &str) -> Option<&str> {
        let mut parts = backup_id.rsplitn(3, '-');
        let suffix = parts.next()?;
        let timestamp = parts.next()?;
        let database = parts.next()?;
        let valid = suffix.len() == 8
            && suffix.chars().all(|c| c.is_ascii_hexdigit())
            && chrono::NaiveDateTime::parse_from_str(timestamp, ID_TIMESTAMP_FORMAT).is_ok()
            && validate_database_name(database).is_ok();
        valid.then_some(database)
    }

    /// Random suffix of the id, used to name throwaway resources.
    #[must_use]
    pub fn id_suffix(&self) -> &str {
        self.backup_id
            .rsplit('-')
            .next()
            .unwrap_or(self.backup_id.as_str())
    }
}

/// Restore a full backup, optionally rolled forward to a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub backup_id: String,
    pub pitr_target: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub backup_id: String,
    pub success: bool,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// Uncompressed bytes loaded.
    pub restored_size: u64,
    pub tables_restored: u64,
    pub pitr_target: Option<DateTime<Utc>>,
    pub wal_segments_replayed: u64,
}

/// Outcome of verifying a backup. Never alters the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub backup_id: String,
    pub verified_at: DateTime<Utc>,
    pub checks: Vec<CheckRecord>,
    pub verified: bool,
}

impl VerificationResult {
    #[must_use]
    pub fn new(backup_id: impl Into<String>, checks: Vec<CheckRecord>) -> Self {
        let verified = checks.iter().all(|c| c.status != CheckStatus::Fail);
        Self {
            backup_id: backup_id.into(),
            verified_at: Utc::now(),
            checks,
            verified,
        }
    }

    #[must_use]
    pub fn check(&self, name: &str) -> Option<&CheckRecord> {
        self.checks.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn exit_signal(&self) -> ExitSignal {
        if self
            .checks
            .iter()
            .any(|c| c.status == CheckStatus::Fail && c.severity == Severity::Critical)
        {
            ExitSignal::CriticalFailure
        } else if self.verified {
            ExitSignal::Success
        } else {
            ExitSignal::ImportantFailure
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_backup_id_round_trips_database() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let id = BackupMetadata::new_id("market-data", at);
        assert!(id.starts_with("market-data-20240301T123005Z-"));
        assert_eq!(BackupMetadata::database_from_id(&id), Some("market-data"));
        assert_ne!(id, BackupMetadata::new_id("market-data", at));
    }

    #[test]
    fn test_database_from_invalid_ids() {
        assert_eq!(BackupMetadata::database_from_id("orders"), None);
        assert_eq!(BackupMetadata::database_from_id("orders-yesterday-abcdef01"), None);
        assert_eq!(BackupMetadata::database_from_id("-20240301T123005Z-abcdef01"), None);
    }

    #[test]
    fn test_database_names() {
        for name in ["orders", "market-data", "_stage", "Pay$2"] {
            assert!(validate_database_name(name).is_ok(), "{name}");
        }
        let too_long = "d".repeat(64);
        for name in ["", "a/b", "../orders", "host=db dbname=orders", "9lives", too_long.as_str()] {
            assert!(
                matches!(validate_database_name(name), Err(LifecycleError::Configuration(_))),
                "{name}"
            );
        }
        assert_eq!(BackupMetadata::database_from_id("a/b-20240301T123005Z-abcdef01"), None);
    }

    #[test]
    fn test_status_keys_and_terminality() {
        assert_eq!(BackupStatus::InProgress.as_str(), "in_progress");
        assert_eq!(
            serde_json::to_string(&BackupStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert!(BackupStatus::Failed.is_terminal());
        assert!(!BackupStatus::Pending.is_terminal());
    }

    #[test]
    fn test_backup_type_parsing() {
        assert_eq!("FULL".parse::<BackupType>().unwrap(), BackupType::Full);
        assert_eq!("wal".parse::<BackupType>().unwrap(), BackupType::Incremental);
        assert!("differential".parse::<BackupType>().is_err());
    }
}
