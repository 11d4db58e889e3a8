//! Installed app registry
//!
//! Writes to one app hold that app's lock from the read until the index is updated.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use hub_core::InstalledApp;
use hub_storage::Repository;
use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult};

pub struct AppRegistry {
    repository: Arc<dyn Repository<InstalledApp>>,
    loaded: OnceCell<()>,
    by_id: DashMap<String, Arc<InstalledApp>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AppRegistry {
    pub fn new(repository: Arc<dyn Repository<InstalledApp>>) -> Self {
        Self {
            repository,
            loaded: OnceCell::new(),
            by_id: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    async fn ensure_loaded(&self) -> RegistryResult<()> {
        self.loaded
            .get_or_try_init(|| async {
                let apps = self.repository.list().await?;
                let count = apps.len();
                for app in apps {
                    self.by_id.insert(app.id.clone(), Arc::new(app));
                }
                info!(count, "Loaded installed apps");
                Ok::<(), RegistryError>(())
            })
            .await?;
        Ok(())
    }

    async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(id.to_string()).or_default().value().clone();
        lock.lock_owned().await
    }

    pub async fn get(&self, id: &str) -> RegistryResult<Option<Arc<InstalledApp>>> {
        self.ensure_loaded().await?;
        Ok(self.by_id.get(id).map(|a| a.clone()))
    }

    pub async fn require(&self, id: &str) -> RegistryResult<Arc<InstalledApp>> {
        self.get(id).await?.ok_or_else(|| RegistryError::NotFound {
            kind: "installed app",
            id: id.to_string(),
        })
    }

    pub async fn list(&self) -> RegistryResult<Vec<Arc<InstalledApp>>> {
        self.ensure_loaded().await?;
        let mut apps: Vec<_> = self.by_id.iter().map(|a| a.clone()).collect();
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(apps)
    }

    /// Ids of installed apps created from the given definition
    pub async fn using_definition(&self, definition_id: &str) -> RegistryResult<Vec<String>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|a| a.definition_id == definition_id)
            .map(|a| a.id.clone())
            .collect())
    }

    pub async fn create(&self, app: InstalledApp) -> RegistryResult<Arc<InstalledApp>> {
        self.ensure_loaded().await?;
        let app = Arc::new(self.repository.create(app).await?);
        self.by_id.insert(app.id.clone(), app.clone());
        info!(id = %app.id, label = %app.label, "Installed app created");
        Ok(app)
    }

    pub async fn update(&self, app: InstalledApp) -> RegistryResult<Arc<InstalledApp>> {
        let _guard = self.lock(&app.id).await;
        self.write(app).await
    }

    /// Read-modify-write helper; `f` sees the latest stored record
    pub async fn update_with<F>(&self, id: &str, f: F) -> RegistryResult<Arc<InstalledApp>>
    where
        F: FnOnce(&mut InstalledApp),
    {
        let _guard = self.lock(id).await;
        let mut app = (*self.require(id).await?).clone();
        f(&mut app);
        self.write(app).await
    }

    async fn write(&self, mut app: InstalledApp) -> RegistryResult<Arc<InstalledApp>> {
        self.require(&app.id).await?;
        app.updated_at = Utc::now();
        let app = Arc::new(self.repository.update(app).await?);
        self.by_id.insert(app.id.clone(), app.clone());
        debug!(id = %app.id, "Installed app updated");
        Ok(app)
    }

    pub async fn delete(&self, id: &str) -> RegistryResult<bool> {
        self.ensure_loaded().await?;
        let guard = self.lock(id).await;
        let removed = self.repository.delete(id).await?;
        self.by_id.remove(id);
        drop(guard);
        self.locks.remove(id);
        if removed {
            info!(id, "Installed app deleted");
        }
        Ok(removed)
    }

    pub async fn flush(&self) -> RegistryResult<()> {
        self.repository.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hub_storage::{MemoryRepository, StorageResult};

    struct YieldingRepository(MemoryRepository<InstalledApp>);

    #[async_trait]
    impl Repository<InstalledApp> for YieldingRepository {
        async fn get(&self, id: &str) -> StorageResult<Option<InstalledApp>> {
            self.0.get(id).await
        }

        async fn list(&self) -> StorageResult<Vec<InstalledApp>> {
            self.0.list().await
        }

        async fn create(&self, record: InstalledApp) -> StorageResult<InstalledApp> {
            self.0.create(record).await
        }

        async fn update(&self, record: InstalledApp) -> StorageResult<InstalledApp> {
            tokio::task::yield_now().await;
            self.0.update(record).await
        }

        async fn delete(&self, id: &str) -> StorageResult<bool> {
            self.0.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_app_lifecycle() {
        let existing = InstalledApp::new("def", "Preloaded");
        let registry = AppRegistry::new(Arc::new(MemoryRepository::with_records([existing.clone()])));

        assert_eq!(registry.list().await.unwrap().len(), 1);
        let app = registry.create(InstalledApp::new("def", "Lights")).await.unwrap();

        let updated = registry
            .update_with(&app.id, |a| {
                a.installed = true;
                a.state.insert("count".to_string(), serde_json::json!(1));
            })
            .await
            .unwrap();
        assert!(updated.installed);
        assert_eq!(updated.state["count"], 1);

        assert_eq!(registry.using_definition("def").await.unwrap().len(), 2);
        assert!(registry.delete(&existing.id).await.unwrap());
        assert!(matches!(
            registry.require(&existing.id).await,
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_interleaved_state_writes_compose() {
        let registry = AppRegistry::new(Arc::new(YieldingRepository(MemoryRepository::new())));
        let app = registry.create(InstalledApp::new("def", "Lights")).await.unwrap();

        let (a, b) = tokio::join!(
            registry.update_with(&app.id, |a| {
                a.state.insert("first".to_string(), serde_json::json!(1));
            }),
            registry.update_with(&app.id, |a| {
                a.state.insert("second".to_string(), serde_json::json!(2));
            }),
        );
        a.unwrap();
        b.unwrap();

        let app = registry.require(&app.id).await.unwrap();
        assert_eq!(app.state["first"], 1);
        assert_eq!(app.state["second"], 2);
    }
}
