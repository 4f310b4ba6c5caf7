//! Backup verification.

use std::path::Path;

use tracing::{info, warn};

use super::artifact::{self, is_encrypted, is_gzip};
use super::metadata::{
    BackupFormat, BackupMetadata, BackupStatus, BackupType, Compression, VerificationResult,
};
use super::{blocking, BackupManager};
use crate::error::{LifecycleError, Result};
use crate::validation::{Category, CheckRecord, Severity};

const CATEGORY: Category = Category::Backup;

/// Checks that depend on the stored artifact, skipped when it cannot be read.
const ARTIFACT_CHECKS: [(&str, Severity); 5] = [
    ("size_nonzero", Severity::Important),
    ("checksum_present", Severity::Critical),
    ("checksum_match", Severity::Critical),
    ("encryption_consistent", Severity::Important),
    ("compression_consistent", Severity::Important),
];

/// Entries every `pg_basebackup` tar carries.
const BASE_ENTRIES: [&str; 2] = ["backup_label", "PG_VERSION"];

/// What verification needs from a downloaded artifact.
struct ArtifactFacts {
    size: u64,
    checksum: String,
    header: Vec<u8>,
    /// Leading bytes under the encryption layer.
    payload: Result<Vec<u8>>,
}

impl BackupManager {
    /// Verify a backup against its catalog record. With `test_restore`, a
    /// logical dump is also restored into a throwaway database that is
    /// dropped again, and a physical base is decoded and its tar listed.
    ///
    /// Catalog records are never modified.
    pub async fn verify_backup(
        &self,
        backup_id: &str,
        test_restore: bool,
    ) -> Result<VerificationResult> {
        let mut checks = Vec::new();

        let Some(meta) = self.catalog.find(backup_id).await? else {
            checks.push(CheckRecord::fail(
                CATEGORY,
                "catalog_record",
                Severity::Critical,
                format!("no catalog record for {backup_id}"),
            ));
            skip_remaining(&mut checks, test_restore, "no catalog record");
            return Ok(VerificationResult::new(backup_id, checks));
        };
        checks.push(CheckRecord::pass(
            CATEGORY,
            "catalog_record",
            Severity::Critical,
            format!("{} backup of {}", meta.backup_type, meta.database),
        ));

        checks.push(if meta.status == BackupStatus::Completed {
            CheckRecord::pass(CATEGORY, "status_completed", Severity::Critical, "completed")
        } else {
            CheckRecord::fail(
                CATEGORY,
                "status_completed",
                Severity::Critical,
                format!("status is {}", meta.status),
            )
        });

        let work = tempfile::tempdir()?;
        let artifact = work.path().join("artifact");
        match self
            .retry
            .run("download", || self.store.get_to_file(&meta.storage_key, &artifact))
            .await
        {
            Ok(_) => {
                checks.push(CheckRecord::pass(
                    CATEGORY,
                    "object_exists",
                    Severity::Critical,
                    meta.storage_location.clone(),
                ));
            }
            Err(e) => {
                checks.push(
                    CheckRecord::fail(
                        CATEGORY,
                        "object_exists",
                        Severity::Critical,
                        format!("artifact {} not readable", meta.storage_key),
                    )
                    .with_details(e.to_string()),
                );
                for (name, severity) in ARTIFACT_CHECKS {
                    let skipped = "artifact not readable";
                    checks.push(CheckRecord::skip(CATEGORY, name, severity, skipped));
                }
                if test_restore {
                    checks.push(CheckRecord::skip(
                        CATEGORY,
                        "test_restore",
                        Severity::Important,
                        "artifact not readable",
                    ));
                }
                return Ok(VerificationResult::new(backup_id, checks));
            }
        }

        let facts = self.artifact_facts(&meta, &artifact).await?;
        checks.extend(inspect_artifact(&meta, facts));

        if test_restore {
            checks.push(self.test_restore(&meta, &artifact, &checks).await);
        }

        let result = VerificationResult::new(backup_id, checks);
        info!(backup_id, verified = result.verified, "Backup verified");
        Ok(result)
    }

    async fn artifact_facts(&self, meta: &BackupMetadata, path: &Path) -> Result<ArtifactFacts> {
        let codec = self.codec.clone();
        let encrypted = meta.encrypted;
        let path = path.to_path_buf();
        blocking(move || {
            let header = artifact::read_header(&path)?;
            let payload = if encrypted && is_encrypted(&header) {
                codec.payload_prefix(&path, true)
            } else {
                Ok(header.clone())
            };
            Ok(ArtifactFacts {
                size: std::fs::metadata(&path)?.len(),
                checksum: artifact::checksum_file(&path)?,
                header,
                payload,
            })
        })
        .await
    }

    async fn test_restore(
        &self,
        meta: &BackupMetadata,
        artifact: &Path,
        checks: &[CheckRecord],
    ) -> CheckRecord {
        const NAME: &str = "test_restore";
        if meta.backup_type == BackupType::Incremental {
            return CheckRecord::skip(
                CATEGORY,
                NAME,
                Severity::Important,
                "incremental backups are replayed through their full base",
            );
        }
        if checks.iter().any(|c| c.is_critical_failure()) {
            let skipped = "artifact failed integrity checks";
            return CheckRecord::skip(CATEGORY, NAME, Severity::Important, skipped);
        }

        let decoded = artifact.with_extension("decoded");
        let outcome = match self.decode_local(meta, artifact, &decoded).await {
            Ok(_) if meta.format == BackupFormat::Physical => self.list_base(meta, &decoded).await,
            Ok(_) => self.restore_into_scratch(meta, &decoded).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(message) => CheckRecord::pass(CATEGORY, NAME, Severity::Important, message),
            Err(e) => CheckRecord::fail(CATEGORY, NAME, Severity::Important, "test restore failed")
                .with_details(e.to_string()),
        }
    }

    /// Restore a logical dump into a throwaway database, then drop it.
    async fn restore_into_scratch(&self, meta: &BackupMetadata, dump: &Path) -> Result<String> {
        let scratch = format!("lifecycle_verify_{}", meta.id_suffix());
        let user = self.settings.database_user.as_str();
        let outcome: Result<u64> = async {
            self.exec(
                "createdb",
                &["createdb", "-U", user, scratch.as_str()],
                None,
                super::COMMAND_TIMEOUT,
            )
            .await?;
            self.exec_streaming(
                "pg_restore",
                &["pg_restore", "-U", user, "--no-owner", "--dbname", scratch.as_str()],
                Some(dump),
                None,
                self.settings.restore_timeout(meta.size_bytes),
            )
            .await?;
            self.count_tables(&scratch).await
        }
        .await;

        if let Err(e) = self
            .exec(
                "dropdb",
                &["dropdb", "-U", user, "--if-exists", scratch.as_str()],
                None,
                super::COMMAND_TIMEOUT,
            )
            .await
        {
            warn!(database = %scratch, error = %e, "Could not drop verification database");
        }
        outcome.map(|tables| format!("restored {tables} tables into {scratch}"))
    }

    /// List a physical base with `tar` inside the workload; a readable base
    /// carries a backup label and a version file.
    async fn list_base(&self, meta: &BackupMetadata, base: &Path) -> Result<String> {
        let output = self
            .exec_streaming(
                "list base backup",
                &["tar", "-tf", "-"],
                Some(base),
                None,
                self.settings.restore_timeout(meta.size_bytes),
            )
            .await?;
        let listing = output.stdout_text();
        let entries: Vec<&str> = listing.lines().map(str::trim).collect();
        let missing: Vec<&str> = BASE_ENTRIES
            .into_iter()
            .filter(|name| !entries.contains(name))
            .collect();
        if missing.is_empty() {
            Ok(format!("base archive lists {} entries", entries.len()))
        } else {
            Err(LifecycleError::Integrity(format!(
                "base archive is missing {}",
                missing.join(", ")
            )))
        }
    }
}

fn inspect_artifact(meta: &BackupMetadata, facts: ArtifactFacts) -> Vec<CheckRecord> {
    let mut checks = Vec::with_capacity(ARTIFACT_CHECKS.len());
    let size = facts.size;

    checks.push(if size == 0 {
        CheckRecord::fail(CATEGORY, "size_nonzero", Severity::Important, "artifact is empty")
    } else if size != meta.artifact_bytes {
        CheckRecord::fail(
            CATEGORY,
            "size_nonzero",
            Severity::Important,
            format!("artifact is {size} bytes, catalog records {}", meta.artifact_bytes),
        )
    } else {
        let message = format!("{size} bytes");
        CheckRecord::pass(CATEGORY, "size_nonzero", Severity::Important, message)
    });

    let well_formed = meta
        .checksum
        .strip_prefix("sha256:")
        .is_some_and(|digest| {
            digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
        });
    checks.push(if well_formed {
        CheckRecord::pass(CATEGORY, "checksum_present", Severity::Critical, "sha256 recorded")
    } else {
        CheckRecord::fail(
            CATEGORY,
            "checksum_present",
            Severity::Critical,
            "no sha256 checksum recorded",
        )
    });

    let actual = facts.checksum;
    checks.push(if actual == meta.checksum {
        CheckRecord::pass(CATEGORY, "checksum_match", Severity::Critical, "checksum matches")
    } else {
        CheckRecord::fail(CATEGORY, "checksum_match", Severity::Critical, "checksum mismatch")
            .with_details(format!("expected {}, got {actual}", meta.checksum))
    });

    checks.push(if is_encrypted(&facts.header) == meta.encrypted {
        CheckRecord::pass(
            CATEGORY,
            "encryption_consistent",
            Severity::Important,
            if meta.encrypted { "encrypted" } else { "not encrypted" },
        )
    } else {
        CheckRecord::fail(
            CATEGORY,
            "encryption_consistent",
            Severity::Important,
            format!("catalog records encrypted={}", meta.encrypted),
        )
    });

    checks.push(match facts.payload {
        Ok(payload) if is_gzip(&payload) == (meta.compression == Compression::Gzip) => {
            CheckRecord::pass(
                CATEGORY,
                "compression_consistent",
                Severity::Important,
                format!("compression {}", meta.compression),
            )
        }
        Ok(_) => CheckRecord::fail(
            CATEGORY,
            "compression_consistent",
            Severity::Important,
            format!("catalog records compression {}", meta.compression),
        ),
        Err(e) => CheckRecord::fail(
            CATEGORY,
            "compression_consistent",
            Severity::Important,
            "payload could not be decrypted",
        )
        .with_details(e.to_string()),
    });
    checks
}

fn skip_remaining(checks: &mut Vec<CheckRecord>, test_restore: bool, reason: &str) {
    checks.push(CheckRecord::skip(CATEGORY, "status_completed", Severity::Critical, reason));
    checks.push(CheckRecord::skip(CATEGORY, "object_exists", Severity::Critical, reason));
    for (name, severity) in ARTIFACT_CHECKS {
        checks.push(CheckRecord::skip(CATEGORY, name, severity, reason));
    }
    if test_restore {
        checks.push(CheckRecord::skip(CATEGORY, "test_restore", Severity::Important, reason));
    }
}
