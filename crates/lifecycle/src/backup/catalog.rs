//! Append-only backup catalog kept in object storage.
//!
//! Every status transition is written as a new object under
//! `<prefix>/catalog/<database>/<backup_id>/<seq>-<status>.json`; the record
//! with the highest sequence number is the current one.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::metadata::BackupMetadata;
use crate::clients::ObjectStorageClient;
use crate::error::{LifecycleError, Result};
use crate::retry::RetryConfig;

pub struct BackupCatalog {
    store: Arc<dyn ObjectStorageClient>,
    prefix: String,
    retry: RetryConfig,
}

impl BackupCatalog {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStorageClient>, prefix: &str, retry: RetryConfig) -> Self {
        Self {
            store,
            prefix: prefix.trim_end_matches('/').to_string(),
            retry,
        }
    }

    fn database_prefix(&self, database: &str) -> String {
        format!("{}/catalog/{database}/", self.prefix)
    }

    fn backup_prefix(&self, database: &str, backup_id: &str) -> String {
        format!("{}{backup_id}/", self.database_prefix(database))
    }

    /// Append a new record for a backup. Rejected once the backup reached a
    /// terminal status.
    pub async fn append(&self, record: &BackupMetadata) -> Result<()> {
        let history = self.history(&record.database, &record.backup_id).await?;
        if let Some(last) = history.last() {
            if last.status.is_terminal() {
                return Err(LifecycleError::Configuration(format!(
                    "Backup {} is already {}; catalog records are immutable",
                    record.backup_id, last.status
                )));
            }
        }

        let key = format!(
            "{}{:04}-{}.json",
            self.backup_prefix(&record.database, &record.backup_id),
            history.len(),
            record.status
        );
        let body = serde_json::to_vec_pretty(record)?;
        let metadata = BTreeMap::from([
            ("backup-id".to_string(), record.backup_id.clone()),
            ("status".to_string(), record.status.to_string()),
        ]);
        self.retry
            .run("catalog append", || self.store.put(&key, body.clone(), metadata.clone()))
            .await?;
        debug!(
            backup_id = %record.backup_id,
            status = %record.status,
            key = %key,
            "Catalog record appended"
        );
        Ok(())
    }

    /// All records of one backup, oldest first.
    pub async fn history(&self, database: &str, backup_id: &str) -> Result<Vec<BackupMetadata>> {
        let prefix = self.backup_prefix(database, backup_id);
        let objects = self
            .retry
            .run("catalog list", || self.store.list(&prefix))
            .await?;
        let mut records = Vec::with_capacity(objects.len());
        for object in objects {
            let stored = self
                .retry
                .run("catalog read", || self.store.get(&object.key))
                .await?;
            records.push(serde_json::from_slice(&stored.bytes)?);
        }
        Ok(records)
    }

    /// Current record of a backup.
    pub async fn latest(&self, database: &str, backup_id: &str) -> Result<Option<BackupMetadata>> {
        Ok(self.history(database, backup_id).await?.pop())
    }

    /// Current record of a backup, resolving the database from the id.
    pub async fn find(&self, backup_id: &str) -> Result<Option<BackupMetadata>> {
        let Some(database) = BackupMetadata::database_from_id(backup_id) else {
            return Ok(None);
        };
        self.latest(database, backup_id).await
    }

    /// Current record of every backup of a database, newest first.
    pub async fn list(&self, database: &str) -> Result<Vec<BackupMetadata>> {
        let prefix = self.database_prefix(database);
        let objects = self
            .retry
            .run("catalog list", || self.store.list(&prefix))
            .await?;

        // Keys sort by sequence within a backup; keep the last key per id.
        let mut latest_keys: BTreeMap<String, String> = BTreeMap::new();
        for object in objects {
            if let Some((backup_id, _)) = object.key[prefix.len()..].split_once('/') {
                latest_keys.insert(backup_id.to_string(), object.key.clone());
            }
        }

        let mut records = Vec::with_capacity(latest_keys.len());
        for key in latest_keys.values() {
            let stored = self
                .retry
                .run("catalog read", || self.store.get(key))
                .await?;
            records.push(serde_json::from_slice::<BackupMetadata>(&stored.bytes)?);
        }
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.backup_id.cmp(&a.backup_id))
        });
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::backup::metadata::{BackupFormat, BackupStatus, BackupType, Compression};
    use crate::clients::MemoryObjectStore;

    fn record(database: &str, minutes_ago: i64, status: BackupStatus) -> BackupMetadata {
        let created_at = Utc::now() - Duration::minutes(minutes_ago);
        BackupMetadata {
            backup_id: BackupMetadata::new_id(database, created_at),
            database: database.into(),
            backup_type: BackupType::Full,
            format: BackupFormat::Logical,
            status,
            size_bytes: 0,
            artifact_bytes: 0,
            storage_location: String::new(),
            storage_key: String::new(),
            created_at,
            completed_at: None,
            checksum: String::new(),
            compression: Compression::Gzip,
            encrypted: false,
            wal_position: None,
            parent_backup_id: None,
            error: None,
        }
    }

    fn catalog(store: &Arc<MemoryObjectStore>) -> BackupCatalog {
        BackupCatalog::new(store.clone(), "lifecycle", RetryConfig::none())
    }

    #[tokio::test]
    async fn test_append_keeps_history_and_latest_wins() {
        let store = Arc::new(MemoryObjectStore::new("backups"));
        let catalog = catalog(&store);
        let mut meta = record("orders", 0, BackupStatus::Pending);
        for status in [BackupStatus::Pending, BackupStatus::InProgress, BackupStatus::Completed] {
            meta.status = status;
            catalog.append(&meta).await.unwrap();
        }

        let history = catalog.history("orders", &meta.backup_id).await.unwrap();
        let statuses: Vec<_> = history.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![BackupStatus::Pending, BackupStatus::InProgress, BackupStatus::Completed]
        );
        assert_eq!(store.len(), 3);
        assert_eq!(
            catalog.find(&meta.backup_id).await.unwrap().unwrap().status,
            BackupStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_append_after_terminal_is_rejected() {
        let store = Arc::new(MemoryObjectStore::new("backups"));
        let catalog = catalog(&store);
        let mut meta = record("orders", 0, BackupStatus::Failed);
        catalog.append(&meta).await.unwrap();

        meta.status = BackupStatus::Completed;
        let err = catalog.append(&meta).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Configuration(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_list_is_newest_first_per_database() {
        let store = Arc::new(MemoryObjectStore::new("backups"));
        let catalog = catalog(&store);
        let old = record("orders", 120, BackupStatus::Completed);
        let new = record("orders", 5, BackupStatus::InProgress);
        let other = record("ledger", 1, BackupStatus::Completed);
        for r in [&old, &new, &other] {
            catalog.append(r).await.unwrap();
        }

        let listed = catalog.list("orders").await.unwrap();
        let ids: Vec<_> = listed.iter().map(|r| r.backup_id.as_str()).collect();
        assert_eq!(ids, vec![new.backup_id.as_str(), old.backup_id.as_str()]);
        assert!(catalog.find("no-such-backup").await.unwrap().is_none());
    }
}
