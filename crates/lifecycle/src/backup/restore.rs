//! Restore and point-in-time recovery.
//!
//! Logical bases are loaded into the running server with `pg_restore`.
//! Physical bases replace the data directory of the stopped server; WAL
//! increments are staged beside it and replayed by Postgres archive recovery
//! up to the requested target.

use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::metadata::{
    BackupFormat, BackupMetadata, BackupStatus, BackupType, RestoreRequest, RestoreResult,
};
use super::{ensure_not_cancelled, BackupManager, COMMAND_TIMEOUT};
use crate::clients::ResourceKind;
use crate::error::{LifecycleError, Result};

const COUNT_TABLES: &str = "SELECT count(*) FROM information_schema.tables \
     WHERE table_schema NOT IN ('pg_catalog', 'information_schema')";

impl BackupManager {
    /// Restore a completed full backup, optionally rolling forward to a
    /// point in time by replaying WAL increments.
    ///
    /// Every request check happens before anything is downloaded, and every
    /// artifact is downloaded and verified before the database is touched.
    /// Cancellation is honoured up to that point.
    pub async fn restore(
        &self,
        request: &RestoreRequest,
        cancel: &CancellationToken,
    ) -> Result<RestoreResult> {
        let started = Instant::now();
        let backup_id = request.backup_id.as_str();
        let failed = |source: LifecycleError| LifecycleError::RestoreFailed {
            backup_id: backup_id.to_string(),
            source: Box::new(source),
        };

        let meta = self
            .catalog
            .find(backup_id)
            .await
            .map_err(failed)?
            .ok_or_else(|| failed(LifecycleError::NotFound(format!("backup {backup_id}"))))?;
        if meta.status != BackupStatus::Completed {
            return Err(failed(LifecycleError::Configuration(format!(
                "backup is {}; only completed backups can be restored",
                meta.status
            ))));
        }
        if meta.backup_type != BackupType::Full {
            return Err(failed(LifecycleError::Configuration(
                "incremental backups are replayed by restoring their full base with a PITR target"
                    .into(),
            )));
        }
        let increments = match request.pitr_target {
            Some(target) => self.plan_replay(&meta, target).await?,
            None => Vec::new(),
        };

        info!(
            backup_id,
            database = %meta.database,
            format = %meta.format,
            pitr_target = ?request.pitr_target,
            increments = increments.len(),
            "Starting restore"
        );

        let result = self
            .execute_restore(&meta, request.pitr_target, &increments, cancel, started)
            .await
            .map_err(failed)?;
        info!(
            backup_id,
            tables = result.tables_restored,
            wal_segments = result.wal_segments_replayed,
            duration_secs = result.duration.as_secs_f64(),
            "Restore finished"
        );
        Ok(result)
    }

    /// Incrementals to replay for a PITR target: those taken before the
    /// target plus the first one taken at or after it.
    async fn plan_replay(
        &self,
        base: &BackupMetadata,
        target: DateTime<Utc>,
    ) -> Result<Vec<BackupMetadata>> {
        let unavailable = |reason: String| LifecycleError::PitrUnavailable {
            backup_id: base.backup_id.clone(),
            reason,
        };
        if target < base.created_at {
            return Err(LifecycleError::RestoreFailed {
                backup_id: base.backup_id.clone(),
                source: Box::new(LifecycleError::Configuration(format!(
                    "PITR target {target} is before the backup was taken ({})",
                    base.created_at
                ))),
            });
        }
        if base.format != BackupFormat::Physical {
            return Err(unavailable(format!(
                "backup is a {} dump; WAL can only be replayed onto a physical base",
                base.format
            )));
        }
        if base.wal_position.is_none() {
            return Err(unavailable("backup has no recorded WAL position".into()));
        }

        let mut chain: Vec<_> = self
            .catalog
            .list(&base.database)
            .await
            .map_err(|e| LifecycleError::RestoreFailed {
                backup_id: base.backup_id.clone(),
                source: Box::new(e),
            })?
            .into_iter()
            .filter(|b| {
                b.backup_type == BackupType::Incremental
                    && b.status == BackupStatus::Completed
                    && b.parent_backup_id.as_deref() == Some(base.backup_id.as_str())
            })
            .collect();
        chain.sort_by_key(|b| b.created_at);
        let Some(newest) = chain.last() else {
            return Err(unavailable("no completed incremental backup after the base".into()));
        };
        if target > newest.created_at {
            return Err(unavailable(format!(
                "PITR target {target} is after the newest WAL increment ({})",
                newest.created_at
            )));
        }

        let mut selected = Vec::new();
        for increment in chain {
            let reaches_target = increment.created_at >= target;
            selected.push(increment);
            if reaches_target {
                break;
            }
        }
        Ok(selected)
    }

    async fn execute_restore(
        &self,
        meta: &BackupMetadata,
        pitr_target: Option<DateTime<Utc>>,
        increments: &[BackupMetadata],
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<RestoreResult> {
        ensure_not_cancelled(cancel, "download")?;
        let work = tempfile::tempdir()?;
        let base = work.path().join("base");
        let restored_size = self.fetch_decoded(meta, &base).await?;
        let mut archives = Vec::with_capacity(increments.len());
        for (index, increment) in increments.iter().enumerate() {
            ensure_not_cancelled(cancel, "download")?;
            let path = work.path().join(format!("wal-{index}"));
            self.fetch_decoded(increment, &path).await?;
            archives.push((increment, path));
        }

        ensure_not_cancelled(cancel, "load")?;
        let mut wal_segments_replayed = 0;
        match meta.format {
            BackupFormat::Logical => self.load_dump(meta, &base).await?,
            BackupFormat::Physical => {
                self.stop_database().await?;
                self.replace_data_directory(meta, &base).await?;
                for (increment, path) in &archives {
                    wal_segments_replayed += self.stage_increment(increment, path).await?;
                }
                if let Some(target) = pitr_target {
                    self.configure_recovery(target).await?;
                }
                self.start_database().await?;
            }
            BackupFormat::WalArchive => {
                return Err(LifecycleError::Configuration(
                    "WAL archives are not restorable on their own".into(),
                ));
            }
        }
        let tables_restored = self.count_tables(&meta.database).await?;

        Ok(RestoreResult {
            backup_id: meta.backup_id.clone(),
            success: true,
            duration: started.elapsed(),
            restored_size,
            tables_restored,
            pitr_target,
            wal_segments_replayed,
        })
    }

    /// Load a logical dump into the running server, replacing its objects.
    async fn load_dump(&self, meta: &BackupMetadata, dump: &Path) -> Result<()> {
        let user = self.settings.database_user.as_str();
        self.exec_streaming(
            "pg_restore",
            &[
                "pg_restore",
                "-U",
                user,
                "--clean",
                "--if-exists",
                "--no-owner",
                "--dbname",
                meta.database.as_str(),
            ],
            Some(dump),
            None,
            self.settings.restore_timeout(meta.size_bytes),
        )
        .await?;
        Ok(())
    }

    async fn stop_database(&self) -> Result<()> {
        let data_dir = self.settings.data_dir.as_str();
        self.exec(
            "stop database",
            &["pg_ctl", "-D", data_dir, "-m", "fast", "-w", "stop"],
            None,
            COMMAND_TIMEOUT,
        )
        .await?;
        info!(data_dir, "Database stopped for base restore");
        Ok(())
    }

    /// Empty the data directory and unpack the base backup into it.
    async fn replace_data_directory(&self, meta: &BackupMetadata, base: &Path) -> Result<()> {
        let data_dir = self.settings.data_dir.as_str();
        let script = format!("find {data_dir} -mindepth 1 -delete && tar -xf - -C {data_dir}");
        self.exec_streaming(
            "unpack base backup",
            &["sh", "-c", script.as_str()],
            Some(base),
            None,
            self.settings.restore_timeout(meta.size_bytes),
        )
        .await?;
        Ok(())
    }

    /// Unpack one WAL increment into the restore directory; returns the
    /// number of segments staged.
    async fn stage_increment(&self, increment: &BackupMetadata, archive: &Path) -> Result<u64> {
        let dir = self.settings.restore_wal_dir.as_str();
        let script = format!("mkdir -p {dir} && tar -xvf - -C {dir}");
        let output = self
            .exec_streaming(
                "stage wal",
                &["sh", "-c", script.as_str()],
                Some(archive),
                None,
                self.settings.restore_timeout(increment.size_bytes),
            )
            .await?;
        let staged = output
            .stdout_text()
            .lines()
            .filter(|line| !line.trim().is_empty())
            .count() as u64;
        info!(backup_id = %increment.backup_id, segments = staged, "WAL increment staged");
        Ok(staged)
    }

    /// Point archive recovery at the staged WAL and stop it at `target`.
    async fn configure_recovery(&self, target: DateTime<Utc>) -> Result<()> {
        let data_dir = self.settings.data_dir.as_str();
        let recovery_conf = format!(
            "restore_command = 'cp {}/%f %p'\n\
             recovery_target_time = '{}'\n\
             recovery_target_action = 'promote'\n",
            self.settings.restore_wal_dir,
            target.format("%Y-%m-%d %H:%M:%S%.6f+00")
        );
        let script =
            format!("cat >> {data_dir}/postgresql.auto.conf && touch {data_dir}/recovery.signal");
        self.exec(
            "configure recovery",
            &["sh", "-c", script.as_str()],
            Some(recovery_conf.into_bytes()),
            COMMAND_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Start the database and wait for its pod to report Ready.
    async fn start_database(&self) -> Result<()> {
        let data_dir = self.settings.data_dir.as_str();
        // The server may outlive the exec session, so a failed exit is not conclusive.
        if let Err(e) = self
            .exec(
                "start database",
                &["pg_ctl", "-D", data_dir, "start"],
                None,
                COMMAND_TIMEOUT,
            )
            .await
        {
            warn!(error = %e, "Database start did not report success");
        }

        let selector = &self.settings.database_workload.label_selector;
        let pods = self
            .cluster
            .list_resources(ResourceKind::Pod, Some(&self.namespace))
            .await?;
        let pod = pods
            .iter()
            .find(|p| p.matches_selector(selector))
            .ok_or_else(|| {
                LifecycleError::NotFound(format!("pod matching {selector} in {}", self.namespace))
            })?;

        let timeout = self.settings.ready_timeout();
        let ready = self
            .cluster
            .wait_for_condition(
                ResourceKind::Pod,
                Some(&self.namespace),
                &pod.name,
                "Ready",
                timeout,
            )
            .await?;
        if ready {
            info!(pod = %pod.name, "Database ready after restore");
            Ok(())
        } else {
            Err(LifecycleError::timeout("database recovery", timeout))
        }
    }

    /// Number of user tables in a database.
    pub(super) async fn count_tables(&self, database: &str) -> Result<u64> {
        let user = self.settings.database_user.as_str();
        let output = self
            .exec(
                "count tables",
                &["psql", "-U", user, "-d", database, "-tAc", COUNT_TABLES],
                None,
                COMMAND_TIMEOUT,
            )
            .await?;
        let text = output.stdout_text();
        text.parse().map_err(|_| {
            LifecycleError::remote("count tables", format!("unexpected output {text:?}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::super::tests::{logical_manager, manager, manager_with};
    use super::*;
    use crate::clients::ClusterClient;
    use crate::config::LifecycleConfig;
    use crate::testing::{postgres_cluster, FaultyStore, FAKE_BASE, FAKE_DUMP};

    fn request(backup_id: &str, pitr_target: Option<DateTime<Utc>>) -> RestoreRequest {
        RestoreRequest {
            backup_id: backup_id.into(),
            pitr_target,
        }
    }

    /// Position of the first exec call containing `pattern`.
    fn call_index(cluster: &crate::testing::FakeCluster, pattern: &str) -> usize {
        cluster
            .exec_calls()
            .iter()
            .position(|c| c.command.contains(pattern))
            .unwrap_or_else(|| panic!("no call matching {pattern}"))
    }

    #[tokio::test]
    async fn test_restore_without_pitr_loads_logical_dump() {
        let cluster = postgres_cluster();
        let store = Arc::new(FaultyStore::new());
        let manager = logical_manager(&cluster, &store, true);
        let cancel = CancellationToken::new();
        let full = manager
            .create_backup("orders", BackupType::Full, &cancel)
            .await
            .unwrap();

        let result = manager
            .restore(&request(&full.backup_id, None), &cancel)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.tables_restored, 12);
        assert_eq!(result.restored_size, FAKE_DUMP.len() as u64);
        assert_eq!(result.wal_segments_replayed, 0);

        let load = &cluster.exec_calls_matching("pg_restore")[0];
        assert!(load.command.contains("--clean --if-exists"));
        assert_eq!(load.stdin.as_deref(), Some(FAKE_DUMP));
        assert!(cluster.exec_calls_matching("recovery.signal").is_empty());
        assert!(cluster.exec_calls_matching("pg_ctl").is_empty());
    }

    #[tokio::test]
    async fn test_physical_restore_replaces_data_directory() {
        let cluster = postgres_cluster();
        let store = Arc::new(FaultyStore::new());
        let manager = manager(&cluster, &store, true);
        let cancel = CancellationToken::new();
        let full = manager
            .create_backup("orders", BackupType::Full, &cancel)
            .await
            .unwrap();

        let result = manager
            .restore(&request(&full.backup_id, None), &cancel)
            .await
            .unwrap();

        assert_eq!(result.restored_size, FAKE_BASE.len() as u64);
        assert_eq!(result.wal_segments_replayed, 0);
        let unpack = &cluster.exec_calls_matching("-mindepth 1 -delete")[0];
        assert!(unpack.command.contains("tar -xf - -C /var/lib/postgresql/data"));
        assert_eq!(unpack.stdin.as_deref(), Some(FAKE_BASE));
        assert!(call_index(&cluster, "-w stop") < call_index(&cluster, "-mindepth 1 -delete"));
        assert!(cluster.exec_calls_matching("pg_restore").is_empty());
        assert!(cluster.exec_calls_matching("recovery.signal").is_empty());
    }

    #[tokio::test]
    async fn test_pitr_replays_increments_onto_physical_base() {
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

        let target = incremental.created_at;
        let result = manager
            .restore(&request(&full.backup_id, Some(target)), &cancel)
            .await
            .unwrap();

        assert_eq!(result.pitr_target, Some(target));
        assert_eq!(result.wal_segments_replayed, 3);
        assert_eq!(result.tables_restored, 12);

        let staged = &cluster.exec_calls_matching("tar -xvf")[0];
        assert!(staged.command.contains("/var/lib/postgresql/wal_restore"));
        assert!(staged
            .stdin
            .as_deref()
            .is_some_and(|archive| archive.starts_with(b"wal-archive:")));

        let recovery = &cluster.exec_calls_matching("recovery.signal")[0];
        let conf = String::from_utf8(recovery.stdin.clone().unwrap()).unwrap();
        assert!(conf.contains("recovery_target_time = '"));
        assert!(conf.contains("restore_command = 'cp /var/lib/postgresql/wal_restore/%f %p'"));

        let order: Vec<_> = ["-w stop", "-mindepth 1 -delete", "tar -xvf", "recovery.signal"]
            .into_iter()
            .map(|pattern| call_index(&cluster, pattern))
            .collect();
        assert!(order.windows(2).all(|pair| pair[0] < pair[1]), "{order:?}");
        let starts = cluster.exec_calls_matching("pg_ctl");
        assert_eq!(starts.len(), 2);
        assert!(starts[1].command.ends_with(" start"));
        assert!(cluster.exec_calls_matching("pg_restore").is_empty());
    }

    #[tokio::test]
    async fn test_pitr_target_after_newest_increment_is_unavailable() {
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

        let target = incremental.created_at + Duration::minutes(5);
        let err = manager
            .restore(&request(&full.backup_id, Some(target)), &cancel)
            .await
            .unwrap_err();
        let LifecycleError::PitrUnavailable { reason, .. } = err else {
            panic!("expected PitrUnavailable");
        };
        assert!(reason.contains("newest WAL increment"));
        assert!(cluster.exec_calls_matching("pg_ctl").is_empty());
    }

    #[tokio::test]
    async fn test_pitr_onto_logical_dump_is_unavailable() {
        let cluster = postgres_cluster();
        let store = Arc::new(FaultyStore::new());
        let manager = logical_manager(&cluster, &store, false);
        let cancel = CancellationToken::new();
        let full = manager
            .create_backup("orders", BackupType::Full, &cancel)
            .await
            .unwrap();
        assert!(full.wal_position.is_none());

        let err = manager
            .restore(&request(&full.backup_id, Some(Utc::now())), &cancel)
            .await
            .unwrap_err();
        let LifecycleError::PitrUnavailable { reason, .. } = err else {
            panic!("expected PitrUnavailable");
        };
        assert!(reason.contains("physical base"));
        assert!(cluster.exec_calls_matching("pg_restore").is_empty());
    }

    #[tokio::test]
    async fn test_pitr_without_wal_position_is_unavailable() {
        let cluster = postgres_cluster();
        cluster.on_exec(
            "pg_walfile_name",
            Err(LifecycleError::remote("exec", "connection reset")),
        );
        let store = Arc::new(FaultyStore::new());
        let manager = manager(&cluster, &store, false);
        let cancel = CancellationToken::new();
        let full = manager
            .create_backup("orders", BackupType::Full, &cancel)
            .await
            .unwrap();
        assert_eq!(full.format, BackupFormat::Physical);
        assert!(full.wal_position.is_none());

        let err = manager
            .restore(&request(&full.backup_id, Some(Utc::now())), &cancel)
            .await
            .unwrap_err();
        let LifecycleError::PitrUnavailable { reason, .. } = err else {
            panic!("expected PitrUnavailable");
        };
        assert!(reason.contains("WAL position"));
    }

    #[tokio::test]
    async fn test_pitr_without_increments_is_unavailable() {
        let cluster = postgres_cluster();
        let store = Arc::new(FaultyStore::new());
        let manager = manager(&cluster, &store, false);
        let cancel = CancellationToken::new();
        let full = manager
            .create_backup("orders", BackupType::Full, &cancel)
            .await
            .unwrap();

        let err = manager
            .restore(&request(&full.backup_id, Some(Utc::now())), &cancel)
            .await
            .unwrap_err();
        let LifecycleError::PitrUnavailable { reason, .. } = err else {
            panic!("expected PitrUnavailable");
        };
        assert!(reason.contains("incremental"));
    }

    #[tokio::test]
    async fn test_target_before_backup_is_rejected() {
        let cluster = postgres_cluster();
        let store = Arc::new(FaultyStore::new());
        let manager = manager(&cluster, &store, false);
        let cancel = CancellationToken::new();
        let full = manager
            .create_backup("orders", BackupType::Full, &cancel)
            .await
            .unwrap();

        let target = full.created_at - Duration::hours(1);
        let err = manager
            .restore(&request(&full.backup_id, Some(target)), &cancel)
            .await
            .unwrap_err();
        let LifecycleError::RestoreFailed { source, .. } = err else {
            panic!("expected RestoreFailed");
        };
        assert!(matches!(*source, LifecycleError::Configuration(_)));
        assert!(cluster.exec_calls_matching("pg_ctl").is_empty());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_touches_nothing() {
        let cluster = postgres_cluster();
        let store = Arc::new(FaultyStore::new());
        let manager = manager(&cluster, &store, false);
        let cancel = CancellationToken::new();
        let full = manager
            .create_backup("orders", BackupType::Full, &cancel)
            .await
            .unwrap();
        store.corrupt_reads("/backups/");

        let err = manager
            .restore(&request(&full.backup_id, None), &cancel)
            .await
            .unwrap_err();
        let LifecycleError::RestoreFailed { source, .. } = err else {
            panic!("expected RestoreFailed");
        };
        assert!(matches!(*source, LifecycleError::Integrity(_)));
        assert!(cluster.exec_calls_matching("pg_ctl").is_empty());
        assert!(cluster.exec_calls_matching("-mindepth 1 -delete").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_and_incremental_backups_are_rejected() {
        let cluster = postgres_cluster();
        let store = Arc::new(FaultyStore::new());
        let manager = manager(&cluster, &store, false);
        let cancel = CancellationToken::new();

        let err = manager
            .restore(&request("orders-20240301T120000Z-deadbeef", None), &cancel)
            .await
            .unwrap_err();
        let LifecycleError::RestoreFailed { source, .. } = err else {
            panic!("expected RestoreFailed");
        };
        assert!(matches!(*source, LifecycleError::NotFound(_)));

        manager
            .create_backup("orders", BackupType::Full, &cancel)
            .await
            .unwrap();
        let incremental = manager
            .create_backup("orders", BackupType::Incremental, &cancel)
            .await
            .unwrap();
        let err = manager
            .restore(&request(&incremental.backup_id, None), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::RestoreFailed { .. }));
    }

    #[tokio::test]
    async fn test_database_not_ready_after_recovery_times_out() {
        let cluster = postgres_cluster();
        let store = Arc::new(FaultyStore::new());
        let mut config = LifecycleConfig::default();
        config.backup.ready_timeout_secs = 0;
        let manager = manager_with(&cluster, &store, &config);
        let cancel = CancellationToken::new();
        let full = manager
            .create_backup("orders", BackupType::Full, &cancel)
            .await
            .unwrap();
        let incremental = manager
            .create_backup("orders", BackupType::Incremental, &cancel)
            .await
            .unwrap();
        cluster.add(
            ResourceKind::Pod,
            crate::testing::pod("platform", "postgres-9", "Pending"),
        );
        // Pods are matched in listing order; make the pending one the only match.
        cluster
            .delete_resource(ResourceKind::Pod, "platform", "postgres-0")
            .await
            .unwrap();

        let target = incremental.created_at;
        let err = manager
            .restore(&request(&full.backup_id, Some(target)), &cancel)
            .await
            .unwrap_err();
        let LifecycleError::RestoreFailed { source, .. } = err else {
            panic!("expected RestoreFailed");
        };
        assert!(matches!(*source, LifecycleError::Timeout { .. }));
    }
}
