//! Object storage adapters.
//!
//! `LocalObjectStore` keeps objects on a filesystem (a mounted bucket or a
//! local directory); `MemoryObjectStore` keeps them in process.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::debug;

use super::{ObjectInfo, ObjectStorageClient, StoredObject};
use crate::error::{LifecycleError, Result};

const OBJECTS_DIR: &str = "objects";
const METADATA_DIR: &str = "metadata";

/// Filesystem-backed object store.
///
/// Objects live under `<root>/objects/<key>`, user metadata under
/// `<root>/metadata/<key>.json`. Writes go to a temporary file first and are
/// renamed into place, so readers never observe a partial object.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(OBJECTS_DIR).join(validate_key(key)?))
    }

    fn metadata_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join(METADATA_DIR)
            .join(format!("{}.json", validate_key(key)?.display())))
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = Self::temporary(path).await?;
        fs::write(&tmp, bytes).await?;
        Self::rename_into_place(&tmp, path).await
    }

    async fn copy_atomic(source: &Path, path: &Path) -> Result<u64> {
        let tmp = Self::temporary(path).await?;
        let copied = fs::copy(source, &tmp).await?;
        Self::rename_into_place(&tmp, path).await?;
        Ok(copied)
    }

    async fn temporary(path: &Path) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple())))
    }

    async fn rename_into_place(tmp: &Path, path: &Path) -> Result<()> {
        if let Err(e) = fs::rename(tmp, path).await {
            let _ = fs::remove_file(tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_metadata(&self, key: &str) -> Result<BTreeMap<String, String>> {
        match fs::read(self.metadata_path(key)?).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reject keys that would escape the store root.
fn validate_key(key: &str) -> Result<PathBuf> {
    let path = Path::new(key);
    let valid = !key.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if valid {
        Ok(path.to_path_buf())
    } else {
        Err(LifecycleError::Configuration(format!(
            "Invalid object key: {key:?}"
        )))
    }
}

#[async_trait]
impl ObjectStorageClient for LocalObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<()> {
        let metadata_json = serde_json::to_vec_pretty(&metadata)?;
        Self::write_atomic(&self.metadata_path(key)?, &metadata_json).await?;
        Self::write_atomic(&self.object_path(key)?, &bytes).await?;
        debug!(key, size = bytes.len(), "Stored object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<StoredObject> {
        let bytes = match fs::read(self.object_path(key)?).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LifecycleError::NotFound(format!("object {key}")));
            }
            Err(e) => return Err(e.into()),
        };
        let metadata = self.read_metadata(key).await?;
        Ok(StoredObject { bytes, metadata })
    }

    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        metadata: BTreeMap<String, String>,
    ) -> Result<()> {
        let metadata_json = serde_json::to_vec_pretty(&metadata)?;
        Self::write_atomic(&self.metadata_path(key)?, &metadata_json).await?;
        let size = Self::copy_atomic(path, &self.object_path(key)?).await?;
        debug!(key, size, "Stored object from file");
        Ok(())
    }

    async fn get_to_file(&self, key: &str, path: &Path) -> Result<BTreeMap<String, String>> {
        match fs::copy(self.object_path(key)?, path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LifecycleError::NotFound(format!("object {key}")));
            }
            Err(e) => return Err(e.into()),
        }
        self.read_metadata(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let base = self.root.join(OBJECTS_DIR);
        let mut pending = vec![base.clone()];
        let mut objects = Vec::new();

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&base) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.starts_with(prefix) || key.contains(".tmp-") {
                    continue;
                }
                let meta = entry.metadata().await?;
                let last_modified: DateTime<Utc> = meta
                    .modified()
                    .map_or_else(|_| Utc::now(), DateTime::<Utc>::from);
                objects.push(ObjectInfo {
                    key,
                    size_bytes: meta.len(),
                    last_modified,
                });
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        for path in [self.object_path(key)?, self.metadata_path(key)?] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn uri(&self, key: &str) -> String {
        format!("file://{}/{OBJECTS_DIR}/{key}", self.root.display())
    }
}

/// In-process object store.
pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, (StoredObject, DateTime<Utc>)>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, BTreeMap<String, (StoredObject, DateTime<Utc>)>> {
        // A poisoned map is still structurally valid.
        self.objects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl ObjectStorageClient for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> Result<()> {
        validate_key(key)?;
        self.lock()
            .insert(key.to_string(), (StoredObject { bytes, metadata }, Utc::now()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<StoredObject> {
        self.lock()
            .get(key)
            .map(|(object, _)| object.clone())
            .ok_or_else(|| LifecycleError::NotFound(format!("object {key}")))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        Ok(self
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (object, modified))| ObjectInfo {
                key: key.clone(),
                size_bytes: object.bytes.len() as u64,
                last_modified: *modified,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    fn uri(&self, key: &str) -> String {
        format!("mem://{}/{key}", self.bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_local_store_put_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        store
            .put("backups/orders/a.dump", b"abc".to_vec(), meta(&[("checksum", "x")]))
            .await
            .unwrap();
        store
            .put("backups/orders/b.dump", b"defg".to_vec(), BTreeMap::new())
            .await
            .unwrap();
        store
            .put("catalog/orders/a/0-pending.json", b"{}".to_vec(), BTreeMap::new())
            .await
            .unwrap();

        let object = store.get("backups/orders/a.dump").await.unwrap();
        assert_eq!(object.bytes, b"abc");
        assert_eq!(object.metadata.get("checksum").map(String::as_str), Some("x"));

        let listed = store.list("backups/orders/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["backups/orders/a.dump", "backups/orders/b.dump"]);
        assert_eq!(listed[1].size_bytes, 4);

        store.delete("backups/orders/a.dump").await.unwrap();
        store.delete("backups/orders/a.dump").await.unwrap();
        assert!(matches!(
            store.get("backups/orders/a.dump").await,
            Err(LifecycleError::NotFound(_))
        ));
        assert!(store
            .uri("backups/orders/b.dump")
            .starts_with("file://"));
    }

    #[tokio::test]
    async fn test_local_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(store
            .put("../outside", b"x".to_vec(), BTreeMap::new())
            .await
            .is_err());
        assert!(store.put("/abs", b"x".to_vec(), BTreeMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_local_store_file_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().join("store"));
        let source = dir.path().join("artifact");
        let payload = b"PGDMP".repeat(10_000);
        std::fs::write(&source, &payload).unwrap();

        store
            .put_file("backups/orders/a.dump.gz", &source, meta(&[("checksum", "y")]))
            .await
            .unwrap();
        let target = dir.path().join("download");
        let metadata = store
            .get_to_file("backups/orders/a.dump.gz", &target)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), payload);
        assert_eq!(metadata.get("checksum").map(String::as_str), Some("y"));
        assert!(matches!(
            store.get_to_file("backups/orders/missing", &target).await,
            Err(LifecycleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_prefix_listing() {
        let store = MemoryObjectStore::new("test");
        for key in ["a/1", "a/2", "ab/1", "b/1"] {
            store.put(key, vec![1], BTreeMap::new()).await.unwrap();
        }
        let keys: Vec<_> = store
            .list("a/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);
        assert_eq!(store.uri("a/1"), "mem://test/a/1");
        assert_eq!(store.len(), 4);
    }
}
