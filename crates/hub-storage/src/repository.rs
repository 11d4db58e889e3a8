//! Generic CRUD port and its in-memory / JSON-file implementations

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use hub_core::{Device, DriverDefinition, InstalledApp, ScheduleJob, Subscription};
use indexmap::IndexMap;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::storage::{Storage, StorageError, StorageFile, StorageResult};

/// Current on-disk format version for every collection
const COLLECTION_VERSION: u32 = 1;

/// A persisted record addressed by a string id
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Storage key of the collection
    const COLLECTION: &'static str;

    fn record_id(&self) -> &str;
}

impl Record for Device {
    const COLLECTION: &'static str = "hub.devices";

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for DriverDefinition {
    const COLLECTION: &'static str = "hub.definitions";

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for InstalledApp {
    const COLLECTION: &'static str = "hub.installed_apps";

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for Subscription {
    const COLLECTION: &'static str = "hub.subscriptions";

    fn record_id(&self) -> &str {
        &self.id
    }
}

impl Record for ScheduleJob {
    const COLLECTION: &'static str = "hub.schedule_jobs";

    fn record_id(&self) -> &str {
        &self.job_key
    }
}

/// CRUD persistence port for one record type
///
/// `list` returns records in insertion order.
#[async_trait]
pub trait Repository<T: Record>: Send + Sync {
    async fn get(&self, id: &str) -> StorageResult<Option<T>>;

    async fn list(&self) -> StorageResult<Vec<T>>;

    /// Insert a new record; fails if the id is taken
    async fn create(&self, record: T) -> StorageResult<T>;

    /// Replace an existing record; fails if the id is unknown
    async fn update(&self, record: T) -> StorageResult<T>;

    /// Remove a record, returning whether it existed
    async fn delete(&self, id: &str) -> StorageResult<bool>;

    /// Write any buffered changes
    async fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Repository held entirely in memory
pub struct MemoryRepository<T> {
    records: RwLock<IndexMap<String, T>>,
}

impl<T: Record> MemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(IndexMap::new()),
        }
    }

    /// Create a repository pre-populated with records
    pub fn with_records(records: impl IntoIterator<Item = T>) -> Self {
        let map = records
            .into_iter()
            .map(|r| (r.record_id().to_string(), r))
            .collect();
        Self {
            records: RwLock::new(map),
        }
    }

    fn snapshot(&self) -> Vec<T> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn get_sync(&self, id: &str) -> Option<T> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
    }

    fn create_sync(&self, record: T) -> StorageResult<T> {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = record.record_id().to_string();
        if records.contains_key(&id) {
            return Err(StorageError::AlreadyExists {
                collection: T::COLLECTION.to_string(),
                id,
            });
        }
        records.insert(id, record.clone());
        Ok(record)
    }

    fn update_sync(&self, record: T) -> StorageResult<T> {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match records.get_mut(record.record_id()) {
            Some(slot) => {
                *slot = record.clone();
                Ok(record)
            }
            None => Err(StorageError::NotFound {
                collection: T::COLLECTION.to_string(),
                id: record.record_id().to_string(),
            }),
        }
    }

    fn delete_sync(&self, id: &str) -> bool {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .shift_remove(id)
            .is_some()
    }
}

impl<T: Record> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Record> Repository<T> for MemoryRepository<T> {
    async fn get(&self, id: &str) -> StorageResult<Option<T>> {
        Ok(self.get_sync(id))
    }

    async fn list(&self) -> StorageResult<Vec<T>> {
        Ok(self.snapshot())
    }

    async fn create(&self, record: T) -> StorageResult<T> {
        self.create_sync(record)
    }

    async fn update(&self, record: T) -> StorageResult<T> {
        self.update_sync(record)
    }

    async fn delete(&self, id: &str) -> StorageResult<bool> {
        Ok(self.delete_sync(id))
    }
}

/// Repository persisted as one versioned JSON file per collection
///
/// Every mutation is written through before it returns.
pub struct JsonRepository<T> {
    storage: Arc<Storage>,
    inner: MemoryRepository<T>,
    /// Serializes file writes so a later snapshot never lands before an earlier one
    write_lock: Mutex<()>,
}

impl<T: Record> JsonRepository<T> {
    /// Open the collection, loading existing records
    pub async fn open(storage: Arc<Storage>) -> StorageResult<Self> {
        let records = match storage.load::<Vec<T>>(T::COLLECTION, COLLECTION_VERSION).await? {
            Some(file) => {
                info!(
                    collection = T::COLLECTION,
                    count = file.data.len(),
                    "Loaded records from storage"
                );
                file.data
            }
            None => Vec::new(),
        };

        Ok(Self {
            storage,
            inner: MemoryRepository::with_records(records),
            write_lock: Mutex::new(()),
        })
    }

    async fn save(&self) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let data = self.inner.snapshot();
        let count = data.len();
        self.storage
            .save(&StorageFile::new(T::COLLECTION, data, COLLECTION_VERSION))
            .await?;
        debug!(collection = T::COLLECTION, count, "Saved records to storage");
        Ok(())
    }
}

#[async_trait]
impl<T: Record> Repository<T> for JsonRepository<T> {
    async fn get(&self, id: &str) -> StorageResult<Option<T>> {
        Ok(self.inner.get_sync(id))
    }

    async fn list(&self) -> StorageResult<Vec<T>> {
        Ok(self.inner.snapshot())
    }

    async fn create(&self, record: T) -> StorageResult<T> {
        let record = self.inner.create_sync(record)?;
        self.save().await?;
        Ok(record)
    }

    async fn update(&self, record: T) -> StorageResult<T> {
        let record = self.inner.update_sync(record)?;
        self.save().await?;
        Ok(record)
    }

    async fn delete(&self, id: &str) -> StorageResult<bool> {
        let existed = self.inner.delete_sync(id);
        if existed {
            self.save().await?;
        }
        Ok(existed)
    }

    async fn flush(&self) -> StorageResult<()> {
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::{EntityType, JobType, Schedule};
    use tempfile::TempDir;

    fn job(key: &str) -> ScheduleJob {
        ScheduleJob {
            job_key: key.to_string(),
            job_type: JobType::RunOnce,
            entity_type: EntityType::SmartApp,
            entity_id: "a1".to_string(),
            handler_method: "h".to_string(),
            data: serde_json::Value::Null,
            schedule: Schedule::At(0),
        }
    }

    #[tokio::test]
    async fn test_memory_crud_preserves_order() {
        let repo = MemoryRepository::new();
        repo.create(job("b")).await.unwrap();
        repo.create(job("a")).await.unwrap();
        repo.create(job("c")).await.unwrap();
        assert!(repo.create(job("a")).await.is_err());

        repo.delete("a").await.unwrap();
        let keys: Vec<String> = repo.list().await.unwrap().into_iter().map(|j| j.job_key).collect();
        assert_eq!(keys, vec!["b", "c"]);

        assert!(repo.update(job("zz")).await.is_err());
    }

    #[tokio::test]
    async fn test_json_repository_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));

        {
            let repo = JsonRepository::<ScheduleJob>::open(storage.clone()).await.unwrap();
            repo.create(job("k1")).await.unwrap();
            repo.create(job("k2")).await.unwrap();
            repo.delete("k1").await.unwrap();
        }

        let reopened = JsonRepository::<ScheduleJob>::open(storage).await.unwrap();
        let jobs = reopened.list().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_key, "k2");
    }
}
