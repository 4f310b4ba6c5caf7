//! Database backup and restore.
//!
//! Backups are produced inside the database workload and spooled to a local
//! file, then encoded (gzip, optional AES-256-GCM) file to file, uploaded to
//! object storage and tracked in an append-only catalog. A backup only counts
//! once its `Completed` record is written, which happens after the uploaded
//! artifact was read back and re-hashed.
//!
//! With WAL capture enabled, full backups are physical base backups so that
//! WAL increments can be replayed on top of them.

pub mod artifact;
pub mod catalog;
pub mod metadata;
mod restore;
mod verify;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use artifact::{ArtifactCodec, EncryptionKey};
pub use catalog::BackupCatalog;
pub use metadata::{
    validate_database_name, BackupFormat, BackupMetadata, BackupStatus, BackupType, Compression,
    RestoreRequest, RestoreResult, VerificationResult,
};

use crate::clients::{ClusterClient, ExecOutput, ObjectStorageClient};
use crate::config::{BackupSettings, LifecycleConfig};
use crate::error::{LifecycleError, Result};
use crate::retry::RetryConfig;

/// Timeout for short helper commands (WAL queries, listings, counts).
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// WAL segment file names: timeline, log and segment as 24 hex digits.
static WAL_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-F]{24}$").expect("wal segment pattern"));

/// Creates, lists, verifies and restores database backups.
pub struct BackupManager {
    cluster: Arc<dyn ClusterClient>,
    store: Arc<dyn ObjectStorageClient>,
    catalog: BackupCatalog,
    settings: BackupSettings,
    namespace: String,
    codec: ArtifactCodec,
    retry: RetryConfig,
}

impl BackupManager {
    /// Build a manager. Fails when encryption is enabled without a key.
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        store: Arc<dyn ObjectStorageClient>,
        config: &LifecycleConfig,
        key: Option<EncryptionKey>,
    ) -> Result<Self> {
        let settings = config.backup.clone();
        let codec = ArtifactCodec::new(settings.compression, settings.encrypt, key)?;
        let retry = RetryConfig::default();
        Ok(Self {
            catalog: BackupCatalog::new(store.clone(), &settings.storage_prefix, retry.clone()),
            cluster,
            store,
            settings,
            namespace: config.namespace.clone(),
            codec,
            retry,
        })
    }

    /// Replace the retry policy for storage calls.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.catalog = BackupCatalog::new(
            self.store.clone(),
            &self.settings.storage_prefix,
            retry.clone(),
        );
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn catalog(&self) -> &BackupCatalog {
        &self.catalog
    }

    /// All backups of a database, newest first.
    pub async fn list_backups(&self, database: &str) -> Result<Vec<BackupMetadata>> {
        validate_database_name(database)?;
        self.catalog.list(database).await
    }

    /// Create a backup. Returns the `Completed` record, or `BackupFailed`
    /// after a `Failed` record was appended. An invalid database name is
    /// rejected before anything is recorded.
    pub async fn create_backup(
        &self,
        database: &str,
        backup_type: BackupType,
        cancel: &CancellationToken,
    ) -> Result<BackupMetadata> {
        validate_database_name(database)?;
        let created_at = Utc::now();
        let backup_id = BackupMetadata::new_id(database, created_at);
        let format = match backup_type {
            BackupType::Full if self.settings.capture_wal_position => BackupFormat::Physical,
            BackupType::Full => BackupFormat::Logical,
            BackupType::Incremental => BackupFormat::WalArchive,
        };
        let storage_key = format!(
            "{}/backups/{database}/{backup_id}{}{}",
            self.settings.storage_prefix.trim_end_matches('/'),
            format.extension(),
            self.codec.extension()
        );

        let mut meta = BackupMetadata {
            backup_id: backup_id.clone(),
            database: database.to_string(),
            backup_type,
            format,
            status: BackupStatus::Pending,
            size_bytes: 0,
            artifact_bytes: 0,
            storage_location: self.store.uri(&storage_key),
            storage_key,
            created_at,
            completed_at: None,
            checksum: String::new(),
            compression: self.codec.compression,
            encrypted: self.codec.encrypts(),
            wal_position: None,
            parent_backup_id: None,
            error: None,
        };
        info!(
            backup_id = %backup_id,
            database,
            backup_type = %backup_type,
            format = %format,
            "Starting backup"
        );

        let failed = |source: LifecycleError| LifecycleError::BackupFailed {
            backup_id: backup_id.clone(),
            source: Box::new(source),
        };
        self.catalog.append(&meta).await.map_err(failed)?;
        meta.status = BackupStatus::InProgress;
        self.catalog.append(&meta).await.map_err(failed)?;

        let mut uploaded = false;
        match self.execute(&mut meta, &mut uploaded, cancel).await {
            Ok(()) => {
                info!(
                    backup_id = %meta.backup_id,
                    size_bytes = meta.size_bytes,
                    artifact_bytes = meta.artifact_bytes,
                    checksum = %meta.checksum,
                    "Backup completed"
                );
                Ok(meta)
            }
            Err(e) => {
                warn!(backup_id = %meta.backup_id, error = %e, "Backup failed");
                if uploaded {
                    if let Err(cleanup) = self.store.delete(&meta.storage_key).await {
                        let key = meta.storage_key.as_str();
                        warn!(key, error = %cleanup, "Could not remove partial artifact");
                    }
                }
                meta.status = BackupStatus::Failed;
                meta.completed_at = None;
                meta.error = Some(e.to_string());
                if let Err(record) = self.catalog.append(&meta).await {
                    let backup_id = meta.backup_id.as_str();
                    warn!(backup_id, error = %record, "Could not record backup failure");
                }
                Err(failed(e))
            }
        }
    }

    async fn execute(
        &self,
        meta: &mut BackupMetadata,
        uploaded: &mut bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        ensure_not_cancelled(cancel, "dump")?;
        let work = tempfile::tempdir()?;
        let raw = work.path().join("raw");
        match meta.format {
            BackupFormat::Physical => {
                // Taken first so that WAL archived from here covers the base.
                meta.wal_position = match self.current_wal_segment().await {
                    Ok(segment) => Some(segment),
                    Err(e) => {
                        let backup_id = meta.backup_id.as_str();
                        warn!(backup_id, error = %e, "Could not capture WAL position");
                        None
                    }
                };
                self.base_backup(&raw).await?;
            }
            BackupFormat::Logical => self.dump_database(&meta.database, &raw).await?,
            BackupFormat::WalArchive => {
                let parent = self.incremental_base(&meta.database).await?;
                let base_position = parent.wal_position.clone().unwrap_or_default();
                let newest = self.archive_wal_since(&base_position, &raw).await?;
                meta.parent_backup_id = Some(parent.backup_id);
                meta.wal_position = Some(newest);
            }
        }

        ensure_not_cancelled(cancel, "upload")?;
        let artifact_path = work.path().join("artifact");
        let encoded = {
            let codec = self.codec.clone();
            let (raw, artifact_path) = (raw.clone(), artifact_path.clone());
            blocking(move || codec.encode_file(&raw, &artifact_path)).await?
        };
        meta.size_bytes = encoded.raw_bytes;
        meta.artifact_bytes = encoded.artifact_bytes;
        meta.checksum = encoded.checksum;

        let object_metadata = BTreeMap::from([
            ("backup-id".to_string(), meta.backup_id.clone()),
            ("checksum".to_string(), meta.checksum.clone()),
        ]);
        *uploaded = true;
        self.retry
            .run("upload", || {
                self.store
                    .put_file(&meta.storage_key, &artifact_path, object_metadata.clone())
            })
            .await?;

        let readback = work.path().join("readback");
        self.retry
            .run("download", || self.store.get_to_file(&meta.storage_key, &readback))
            .await?;
        let stored_checksum = blocking(move || artifact::checksum_file(&readback)).await?;
        if stored_checksum != meta.checksum {
            return Err(LifecycleError::Integrity(format!(
                "uploaded artifact checksum {stored_checksum} does not match {}",
                meta.checksum
            )));
        }

        meta.status = BackupStatus::Completed;
        meta.completed_at = Some(Utc::now());
        self.catalog.append(meta).await
    }

    async fn dump_database(&self, database: &str, out: &Path) -> Result<()> {
        let user = self.settings.database_user.as_str();
        self.exec_streaming(
            "pg_dump",
            &["pg_dump", "-U", user, "--format=custom", "--dbname", database],
            None,
            Some(out),
            self.settings.dump_timeout(),
        )
        .await?;
        let bytes = spooled_len(out, "pg_dump").await?;
        debug!(database, bytes, "Dump finished");
        Ok(())
    }

    /// Tar of the whole data directory with the WAL needed to make it
    /// consistent.
    async fn base_backup(&self, out: &Path) -> Result<()> {
        let user = self.settings.database_user.as_str();
        self.exec_streaming(
            "pg_basebackup",
            &[
                "pg_basebackup",
                "-U",
                user,
                "-D",
                "-",
                "-Ft",
                "-X",
                "fetch",
                "--checkpoint=fast",
            ],
            None,
            Some(out),
            self.settings.dump_timeout(),
        )
        .await?;
        let bytes = spooled_len(out, "pg_basebackup").await?;
        debug!(bytes, "Base backup finished");
        Ok(())
    }

    async fn current_wal_segment(&self) -> Result<String> {
        let user = self.settings.database_user.as_str();
        let output = self
            .exec(
                "wal position",
                &[
                    "psql",
                    "-U",
                    user,
                    "-tAc",
                    "SELECT pg_walfile_name(pg_current_wal_lsn())",
                ],
                None,
                COMMAND_TIMEOUT,
            )
            .await?;
        let segment = output.stdout_text();
        if WAL_SEGMENT.is_match(&segment) {
            Ok(segment)
        } else {
            Err(LifecycleError::remote(
                "wal position",
                format!("unexpected WAL segment name {segment:?}"),
            ))
        }
    }

    /// Newest completed full backup with a WAL position.
    async fn incremental_base(&self, database: &str) -> Result<BackupMetadata> {
        self.catalog
            .list(database)
            .await?
            .into_iter()
            .find(|b| {
                b.backup_type == BackupType::Full
                    && b.status == BackupStatus::Completed
                    && b.wal_position.is_some()
            })
            .ok_or_else(|| {
                LifecycleError::Configuration(format!(
                    "No completed full backup with a WAL position exists for {database}"
                ))
            })
    }

    /// Tar of the WAL segments from `base` on, written to `out`. Returns the
    /// newest segment name.
    async fn archive_wal_since(&self, base: &str, out: &Path) -> Result<String> {
        let wal_dir = self.settings.wal_dir.as_str();
        let listing = self
            .exec("list wal", &["ls", "-1", wal_dir], None, COMMAND_TIMEOUT)
            .await?;
        let mut segments: Vec<String> = listing
            .stdout_text()
            .lines()
            .map(str::trim)
            .filter(|name| WAL_SEGMENT.is_match(name) && *name >= base)
            .map(str::to_string)
            .collect();
        segments.sort();
        let Some(newest) = segments.last().cloned() else {
            return Err(LifecycleError::Configuration(format!(
                "No WAL segments at or after {base}"
            )));
        };

        let mut command = vec!["tar", "-cf", "-", "-C", wal_dir];
        command.extend(segments.iter().map(String::as_str));
        self.exec_streaming(
            "archive wal",
            &command,
            None,
            Some(out),
            self.settings.dump_timeout(),
        )
        .await?;
        debug!(segments = segments.len(), newest = %newest, "WAL archived");
        Ok(newest)
    }

    /// Download an artifact to `out` beside a temporary copy of the stored
    /// bytes, check the copy against the catalog checksum and decode it.
    /// Returns the decoded size.
    async fn fetch_decoded(&self, meta: &BackupMetadata, out: &Path) -> Result<u64> {
        let stored = out.with_extension("artifact");
        self.retry
            .run("download", || self.store.get_to_file(&meta.storage_key, &stored))
            .await?;
        let actual = {
            let stored = stored.clone();
            blocking(move || artifact::checksum_file(&stored)).await?
        };
        if actual != meta.checksum {
            return Err(LifecycleError::Integrity(format!(
                "checksum mismatch for {}: expected {}, got {actual}",
                meta.storage_key, meta.checksum
            )));
        }
        self.decode_local(meta, &stored, out).await
    }

    /// Decode a downloaded artifact into `out` and drop the artifact.
    async fn decode_local(&self, meta: &BackupMetadata, stored: &Path, out: &Path) -> Result<u64> {
        let codec = self.codec.clone();
        let (compression, encrypted) = (meta.compression, meta.encrypted);
        let (stored, out): (PathBuf, PathBuf) = (stored.into(), out.into());
        blocking(move || {
            let size = codec.decode_file(&stored, &out, compression, encrypted)?;
            std::fs::remove_file(&stored)?;
            Ok(size)
        })
        .await
    }

    /// Run a command in the database workload under a timeout. Non-zero exit
    /// codes are errors.
    async fn exec(
        &self,
        operation: &str,
        command: &[&str],
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let selector = self.settings.database_workload.in_namespace(&self.namespace);
        let command: Vec<String> = command.iter().map(|s| (*s).to_string()).collect();
        let output = tokio::time::timeout(
            timeout,
            self.cluster.exec_in_workload(&selector, &command, stdin),
        )
        .await
        .map_err(|_| LifecycleError::timeout(operation, timeout))??;
        succeeded(operation, output)
    }

    /// Like [`Self::exec`], with stdin read from `input` and stdout written
    /// to `output` as they stream.
    async fn exec_streaming(
        &self,
        operation: &str,
        command: &[&str],
        input: Option<&Path>,
        output: Option<&Path>,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let selector = self.settings.database_workload.in_namespace(&self.namespace);
        let command: Vec<String> = command.iter().map(|s| (*s).to_string()).collect();
        let result = tokio::time::timeout(
            timeout,
            self.cluster.exec_streaming(&selector, &command, input, output),
        )
        .await
        .map_err(|_| LifecycleError::timeout(operation, timeout))??;
        succeeded(operation, result)
    }
}

fn succeeded(operation: &str, output: ExecOutput) -> Result<ExecOutput> {
    if output.success() {
        Ok(output)
    } else {
        Err(LifecycleError::remote(
            operation,
            format!("exit code {}: {}", output.exit_code, output.stderr.trim()),
        ))
    }
}

/// Size of a spooled tool output; empty output is an error.
async fn spooled_len(path: &Path, tool: &str) -> Result<u64> {
    let bytes = tokio::fs::metadata(path).await?.len();
    if bytes == 0 {
        return Err(LifecycleError::Integrity(format!("{tool} produced no output")));
    }
    Ok(bytes)
}

/// Run file-bound codec work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| LifecycleError::Io(std::io::Error::other(e)))?
}

fn ensure_not_cancelled(cancel: &CancellationToken, step: &str) -> Result<()> {
    if cancel.is_cancelled() {
        Err(LifecycleError::Cancelled {
            step: step.to_string(),
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        postgres_cluster, FakeCluster, FaultyStore, FAKE_BASE, FAKE_DUMP, WAL_BASE,
    };

    pub(super) const KEY_HEX: &str =
        "8f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0";

    pub(super) fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    pub(super) fn manager_with(
        cluster: &FakeCluster,
        store: &Arc<FaultyStore>,
        config: &LifecycleConfig,
    ) -> BackupManager {
        let key = config
            .backup
            .encrypt
            .then(|| EncryptionKey::from_hex(KEY_HEX).unwrap());
        BackupManager::new(Arc::new(cluster.clone()), store.clone(), config, key)
            .unwrap()
            .with_retry(fast_retry())
    }

    /// Manager taking physical full backups with WAL positions.
    pub(super) fn manager(
        cluster: &FakeCluster,
        store: &Arc<FaultyStore>,
        encrypt: bool,
    ) -> BackupManager {
        let mut config = LifecycleConfig::default();
        config.backup.encrypt = encrypt;
        manager_with(cluster, store, &config)
    }

    /// Manager taking logical `pg_dump` full backups.
    pub(super) fn logical_manager(
        cluster: &FakeCluster,
        store: &Arc<FaultyStore>,
        encrypt: bool,
    ) -> BackupManager {
        let mut config = LifecycleConfig::default();
        config.backup.encrypt = encrypt;
        config.backup.capture_wal_position = false;
        manager_with(cluster, store, &config)
    }

    #[tokio::test]
    async fn test_full_backup_completes() {
        let cluster = postgres_cluster();
        let store = Arc::new(FaultyStore::new());
        let manager = manager(&cluster, &store, true);

        let meta = manager
            .create_backup("orders", BackupType::Full, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(meta.status, BackupStatus::Completed);
        assert_eq!(meta.format, BackupFormat::Physical);
        assert_eq!(meta.compression, Compression::Gzip);
        assert!(meta.encrypted);
        assert_eq!(meta.size_bytes, FAKE_BASE.len() as u64);
        assert_eq!(meta.wal_position.as_deref(), Some(WAL_BASE));
        assert!(meta.storage_key.ends_with(".base.tar.gz.enc"));
        assert!(meta.storage_location.starts_with("mem://test/"));
        assert!(meta.checksum.starts_with("sha256:"));

        let stored = store.inner.get(&meta.storage_key).await.unwrap();
        assert_eq!(stored.bytes.len() as u64, meta.artifact_bytes);
        assert_eq!(stored.metadata["checksum"], meta.checksum);

        let history = manager
            .catalog()
            .history("orders", &meta.backup_id)
            .await
            .unwrap();
        let statuses: Vec<_> = history.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![BackupStatus::Pending, BackupStatus::InProgress, BackupStatus::Completed]
        );

        let calls: Vec<_> = cluster.exec_calls().into_iter().map(|c| c.command).collect();
        let position = calls.iter().position(|c| c.contains("pg_walfile_name")).unwrap();
        let base = calls.iter().position(|c| c.contains("pg_basebackup")).unwrap();
        assert!(position < base, "WAL position must be taken before the base");
        assert!(calls[base].contains("-D - -Ft -X fetch"));
        assert!(cluster.exec_calls_matching("pg_dump").is_empty());
    }

    #[tokio::test]
    async fn test_logical_backup_without_wal_capture() {
        let cluster = postgres_cluster();
        let store = Arc::new(FaultyStore::new());
        let manager = logical_manager(&cluster, &store, false);

        let meta = manager
            .create_backup("orders", BackupType::Full, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(meta.format, BackupFormat::Logical);
        assert_eq!(meta.size_bytes, FAKE_DUMP.len() as u64);
        assert!(meta.wal_position.is_none());
        assert!(meta.storage_key.ends_with(".dump.gz"));
        let dump = &cluster.exec_calls_matching("pg_dump")[0];
        assert!(dump.command.contains("--format=custom --dbname orders"));
        assert_eq!(dump.selector, "platform/app=postgres");
        assert!(cluster.exec_calls_matching("pg_basebackup").is_empty());
    }

    #[tokio::test]
    async fn test_large_dump_streams_through_codec() {
        let cluster = postgres_cluster();
        let dump: Vec<u8> = (0..300_000u32).flat_map(u32::to_le_bytes).collect();
        let reply = dump.clone();
        cluster.on_exec_with("pg_dump", move |_, _| {
            Ok(ExecOutput {
                stdout: reply.clone(),
                stderr: String::new(),
                exit_code: 0,
            })
        });
        let store = Arc::new(FaultyStore::new());
        let manager = logical_manager(&cluster, &store, true);

        let meta = manager
            .create_backup("orders", BackupType::Full, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(meta.size_bytes, dump.len() as u64);

        let dir = tempfile::tempdir().unwrap();
        let (stored, decoded) = (dir.path().join("stored"), dir.path().join("decoded"));
        store.inner.get_to_file(&meta.storage_key, &stored).await.unwrap();
        assert_eq!(artifact::checksum_file(&stored).unwrap(), meta.checksum);
        let size = manager.decode_local(&meta, &stored, &decoded).await.unwrap();
        assert_eq!(size, meta.size_bytes);
        assert_eq!(std::fs::read(&decoded).unwrap(), dump);
        assert!(!stored.exists());
    }

    #[tokio::test]
    async fn test_invalid_database_names_are_rejected_before_recording() {
        let cluster = postgres_cluster();
        let store = Arc::new(FaultyStore::new());
        let manager = manager(&cluster, &store, false);
        let cancel = CancellationToken::new();

        for database in ["a/b", "host=db.internal dbname=orders", "", "../orders"] {
            let err = manager
                .create_backup(database, BackupType::Full, &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, LifecycleError::Configuration(_)), "{database}: {err}");
        }
        assert!(store.inner.is_empty());
        assert!(cluster.exec_calls().is_empty());

        manager
            .create_backup("a", BackupType::Full, &cancel)
            .await
            .unwrap();
        let err = manager.list_backups("a/b").await.unwrap_err();
        assert!(matches!(err, LifecycleError::Configuration(_)));
        assert_eq!(manager.list_backups("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_incremental_requires_completed_full() {
        let cluster = postgres_cluster();
        let store = Arc::new(FaultyStore::new());
        let manager = manager(&cluster, &store, false);

        let err = manager
            .create_backup("orders", BackupType::Incremental, &CancellationToken::new())
            .await
            .unwrap_err();
        let LifecycleError::BackupFailed { backup_id, source } = err else {
            panic!("expected BackupFailed");
        };
        assert!(matches!(*source, LifecycleError::Configuration(_)));

        let latest = manager.catalog().find(&backup_id).await.unwrap().unwrap();
        assert_eq!(latest.status, BackupStatus::Failed);
        assert!(latest.error.is_some());
        assert!(cluster.exec_calls_matching("tar -cf").is_empty());
    }

    #[tokio::test]
    async fn test_incremental_archives_segments_from_base() {
        let cluster = postgres_cluster();
        let store = Arc::new(FaultyStore::new());
        let manager = manager(&cluster, &store, false);
        let cancel = CancellationToken::new();

        let full = manager
            .create_backup("orders", BackupType::Full, &cancel)
            .await
            .unwrap();
        let incremental = manager
            .create_backup("orders", BackupType::Incremental, &cancel)
            .await
            .unwrap();

        assert_eq!(incremental.parent_backup_id.as_deref(), Some(full.backup_id.as_str()));
        assert_eq!(
            incremental.wal_position.as_deref(),
            Some("000000010000000000000005")
        );
        assert!(incremental.storage_key.ends_with(".wal.tar.gz"));

        let tar = &cluster.exec_calls_matching("tar -cf")[0];
        assert!(tar.command.ends_with(&format!(
            "{WAL_BASE} 000000010000000000000004 000000010000000000000005"
        )));
        assert!(!tar.command.contains("000000010000000000000002"));
        assert_eq!(incremental.format, BackupFormat::WalArchive);

        let listed = manager.list_backups("orders").await.unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn test_upload_failure_marks_failed_and_cleans_up() {
        let cluster = postgres_cluster();
        let store = Arc::new(FaultyStore::new());
        store.fail_puts("/backups/");
        let manager = manager(&cluster, &store, false);

        let err = manager
            .create_backup("orders", BackupType::Full, &CancellationToken::new())
            .await
            .unwrap_err();
        let LifecycleError::BackupFailed { backup_id, .. } = err else {
            panic!("expected BackupFailed");
        };

        let latest = manager.catalog().find(&backup_id).await.unwrap().unwrap();
        assert_eq!(latest.status, BackupStatus::Failed);
        assert!(latest.error.unwrap().contains("access denied"));
        assert!(store.inner.list("lifecycle/backups/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_upload_errors_are_retried() {
        let cluster = postgres_cluster();
        let store = Arc::new(FaultyStore::new());
        let manager = manager(&cluster, &store, false);
        store.transient_failures(1);

        let meta = manager
            .create_backup("orders", BackupType::Full, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(meta.status, BackupStatus::Completed);
    }

    #[tokio::test]
    async fn test_corrupted_read_back_fails_backup() {
        let cluster = postgres_cluster();
        let store = Arc::new(FaultyStore::new());
        store.corrupt_reads("/backups/");
        let manager = manager(&cluster, &store, false);

        let err = manager
            .create_backup("orders", BackupType::Full, &CancellationToken::new())
            .await
            .unwrap_err();
        let LifecycleError::BackupFailed { source, .. } = err else {
            panic!("expected BackupFailed");
        };
        assert!(matches!(*source, LifecycleError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_dump_failure_is_backup_failed() {
        let cluster = postgres_cluster();
        cluster.on_exec(
            "pg_basebackup",
            Ok(ExecOutput {
                stdout: Vec::new(),
                stderr: "pg_basebackup: error: connection refused".into(),
                exit_code: 1,
            }),
        );
        let store = Arc::new(FaultyStore::new());
        let manager = manager(&cluster, &store, false);

        let err = manager
            .create_backup("orders", BackupType::Full, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert!(store.inner.list("lifecycle/backups/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_backup_is_recorded_failed() {
        let cluster = postgres_cluster();
        let store = Arc::new(FaultyStore::new());
        let manager = manager(&cluster, &store, false);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = manager
            .create_backup("orders", BackupType::Full, &cancel)
            .await
            .unwrap_err();
        let LifecycleError::BackupFailed { backup_id, source } = err else {
            panic!("expected BackupFailed");
        };
        assert!(matches!(*source, LifecycleError::Cancelled { .. }));
        assert!(cluster.exec_calls_matching("pg_basebackup").is_empty());
        let latest = manager.catalog().find(&backup_id).await.unwrap().unwrap();
        assert_eq!(latest.status, BackupStatus::Failed);
    }

    #[test]
    fn test_encryption_without_key_is_rejected() {
        let mut config = LifecycleConfig::default();
        config.backup.encrypt = true;
        let result = BackupManager::new(
            Arc::new(postgres_cluster()),
            Arc::new(FaultyStore::new()),
            &config,
            None,
        );
        assert!(matches!(result, Err(LifecycleError::Configuration(_))));
    }
}
