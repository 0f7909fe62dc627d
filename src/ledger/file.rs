//! File-backed operation store
//!
//! One JSON document per record under a root directory. Writes go to a
//! temporary file that is renamed over the target, so a crash never leaves
//! a torn record behind.

use super::{OperationRecord, OperationStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

const RECORD_EXTENSION: &str = "json";

/// Durable operation store on the local filesystem
pub struct FileOperationStore {
    root_path: PathBuf,
    sync_writes: bool,
}

impl FileOperationStore {
    /// Open (creating if needed) a store rooted at `root_path`
    pub async fn open(root_path: impl Into<PathBuf>) -> Result<Self> {
        let root_path = root_path.into();
        fs::create_dir_all(&root_path).await?;
        Ok(Self {
            root_path,
            sync_writes: true,
        })
    }

    /// Skip fsync on write (for tests and benchmarks)
    pub fn without_sync(mut self) -> Self {
        self.sync_writes = false;
        self
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Instance names may contain any character; encode them into a flat filename
    fn record_path(&self, instance_name: &str) -> PathBuf {
        self.root_path.join(format!(
            "{}.{}",
            urlencoding::encode(instance_name),
            RECORD_EXTENSION
        ))
    }

    async fn read_record(path: &Path) -> Result<Option<OperationRecord>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl OperationStore for FileOperationStore {
    async fn get(&self, instance_name: &str) -> Result<Option<OperationRecord>> {
        Self::read_record(&self.record_path(instance_name)).await
    }

    async fn put(&self, record: &OperationRecord) -> Result<()> {
        let path = self.record_path(&record.instance_name);
        let tmp_path = path.with_extension("tmp");
        let body = serde_json::to_vec_pretty(record)?;

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&body).await?;
        if self.sync_writes {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn delete(&self, instance_name: &str) -> Result<()> {
        match fs::remove_file(self.record_path(instance_name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<OperationRecord>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.root_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |e| e != RECORD_EXTENSION) {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(Error::JsonParse(e)) => {
                    warn!("Skipping unreadable ledger record {}: {}", path.display(), e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(records)
    }

    fn store_name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{OperationKind, TaskId};
    use crate::ledger::OperationStatus;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let name = "create-snapshot-nightly/backup-vol#1";

        {
            let store = FileOperationStore::open(dir.path()).await.unwrap().without_sync();
            let mut record = OperationRecord::new(name, OperationKind::CreateSnapshot)
                .with_volume("vol#1")
                .with_capacity_hint(1 << 30);
            record.begin(&TaskId::from("task-7"));
            store.put(&record).await.unwrap();
        }

        let store = FileOperationStore::open(dir.path()).await.unwrap();
        let record = store.get(name).await.unwrap().unwrap();
        assert_eq!(record.status, OperationStatus::InProgress);
        assert_eq!(record.task_id, "task-7");
        assert_eq!(record.capacity_hint, Some(1 << 30));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileOperationStore::open(dir.path()).await.unwrap().without_sync();

        let mut record = OperationRecord::new("delete-volume-v1", OperationKind::DeleteVolume);
        store.put(&record).await.unwrap();
        record.succeed();
        store.put(&record).await.unwrap();

        let loaded = store.get("delete-volume-v1").await.unwrap().unwrap();
        assert_eq!(loaded.status, OperationStatus::Success);

        store.delete("delete-volume-v1").await.unwrap();
        store.delete("delete-volume-v1").await.unwrap();
        assert!(store.get("delete-volume-v1").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_skips_foreign_files() {
        let dir = TempDir::new().unwrap();
        let store = FileOperationStore::open(dir.path()).await.unwrap().without_sync();

        fs::write(dir.path().join("notes.txt"), b"hello").await.unwrap();
        fs::write(dir.path().join("broken.json"), b"{not json").await.unwrap();
        store
            .put(&OperationRecord::new("create-volume-a", OperationKind::CreateVolume))
            .await
            .unwrap();

        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].instance_name, "create-volume-a");
    }
}
