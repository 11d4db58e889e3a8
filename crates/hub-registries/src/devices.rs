//! Device registry
//!
//! Devices are indexed by id and by identity key
//! (`integration id + upper(device network id)`), the address used to route
//! incoming protocol messages.
//!
//! Writes to one device are serialized: every read-modify-write holds the
//! device's lock from the read until the indexes are updated.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use hub_core::{identity_key, Device, EntityRef, Event};
use hub_storage::Repository;
use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};

pub struct DeviceRegistry {
    repository: Arc<dyn Repository<Device>>,
    loaded: OnceCell<()>,
    /// Primary index: device id -> device
    by_id: DashMap<String, Arc<Device>>,
    /// Identity key -> device id
    by_identity: DashMap<String, String>,
    /// Per-device write locks
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DeviceRegistry {
    pub fn new(repository: Arc<dyn Repository<Device>>) -> Self {
        Self {
            repository,
            loaded: OnceCell::new(),
            by_id: DashMap::new(),
            by_identity: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    async fn ensure_loaded(&self) -> RegistryResult<()> {
        self.loaded
            .get_or_try_init(|| async {
                let devices = self.repository.list().await?;
                let count = devices.len();
                for device in devices {
                    self.index(Arc::new(device));
                }
                info!(count, "Loaded devices");
                Ok::<(), RegistryError>(())
            })
            .await?;
        Ok(())
    }

    fn index(&self, device: Arc<Device>) {
        let key = device.identity_key();
        if let Some(previous) = self.by_identity.insert(key.clone(), device.id.clone()) {
            if previous != device.id {
                warn!(key = %key, previous = %previous, device = %device.id, "Identity key reassigned");
            }
        }
        self.by_id.insert(device.id.clone(), device);
    }

    fn unindex(&self, device: &Device) {
        let key = device.identity_key();
        self.by_identity.remove_if(&key, |_, id| *id == device.id);
        self.by_id.remove(&device.id);
    }

    async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(id.to_string()).or_default().value().clone();
        lock.lock_owned().await
    }

    pub async fn get(&self, id: &str) -> RegistryResult<Option<Arc<Device>>> {
        self.ensure_loaded().await?;
        Ok(self.by_id.get(id).map(|d| d.clone()))
    }

    pub async fn require(&self, id: &str) -> RegistryResult<Arc<Device>> {
        self.get(id).await?.ok_or_else(|| RegistryError::NotFound {
            kind: "device",
            id: id.to_string(),
        })
    }

    /// Look a device up by integration and network id (case-insensitive)
    pub async fn get_by_network_id(
        &self,
        integration_id: Option<&str>,
        device_network_id: &str,
    ) -> RegistryResult<Option<Arc<Device>>> {
        self.ensure_loaded().await?;
        let key = identity_key(integration_id, device_network_id);
        let Some(id) = self.by_identity.get(&key).map(|id| id.clone()) else {
            return Ok(None);
        };
        Ok(self.by_id.get(&id).map(|d| d.clone()))
    }

    pub async fn list(&self) -> RegistryResult<Vec<Arc<Device>>> {
        self.ensure_loaded().await?;
        let mut devices: Vec<_> = self.by_id.iter().map(|d| d.clone()).collect();
        devices.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(devices)
    }

    /// Devices whose parent is the given entity
    pub async fn children_of(&self, parent: &EntityRef) -> RegistryResult<Vec<Arc<Device>>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|d| d.parent().as_ref() == Some(parent))
            .collect())
    }

    /// Ids of devices running the given definition
    pub async fn using_definition(&self, definition_id: &str) -> RegistryResult<Vec<String>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|d| d.definition_id == definition_id)
            .map(|d| d.id.clone())
            .collect())
    }

    /// Register a new device; its identity key must be free
    pub async fn create(&self, device: Device) -> RegistryResult<Arc<Device>> {
        self.ensure_loaded().await?;
        let key = device.identity_key();
        if self.by_identity.contains_key(&key) {
            return Err(RegistryError::DuplicateNetworkId { key });
        }
        let device = Arc::new(self.repository.create(device).await?);
        self.index(device.clone());
        info!(id = %device.id, name = %device.display_name(), key = %key, "Device created");
        Ok(device)
    }

    /// Replace a device record, re-indexing its identity key
    pub async fn update(&self, device: Device) -> RegistryResult<Arc<Device>> {
        let _guard = self.lock(&device.id).await;
        self.write(device).await
    }

    /// Read-modify-write helper; `f` sees the latest stored record
    pub async fn update_with<F>(&self, id: &str, f: F) -> RegistryResult<Arc<Device>>
    where
        F: FnOnce(&mut Device),
    {
        let _guard = self.lock(id).await;
        let mut device = (*self.require(id).await?).clone();
        f(&mut device);
        self.write(device).await
    }

    /// Record an event's value as the device's current state for that attribute
    pub async fn apply_event(&self, event: &Event) -> RegistryResult<Option<Arc<Device>>> {
        self.ensure_loaded().await?;
        if !self.by_id.contains_key(&event.source_id) {
            return Ok(None);
        }
        let _guard = self.lock(&event.source_id).await;
        // Deleted while waiting for the lock
        let Some(current) = self.get(&event.source_id).await? else {
            return Ok(None);
        };
        let mut device = (*current).clone();
        device
            .current_states
            .insert(event.name.clone(), event.to_state_record());
        self.write(device).await.map(Some)
    }

    /// Caller holds the device's lock
    async fn write(&self, mut device: Device) -> RegistryResult<Arc<Device>> {
        let current = self.require(&device.id).await?;
        let key = device.identity_key();
        if key != current.identity_key() {
            if let Some(owner) = self.by_identity.get(&key) {
                if *owner != device.id {
                    return Err(RegistryError::DuplicateNetworkId { key });
                }
            }
        }
        device.updated_at = Utc::now();
        let device = Arc::new(self.repository.update(device).await?);
        self.unindex(&current);
        self.index(device.clone());
        debug!(id = %device.id, "Device updated");
        Ok(device)
    }

    pub async fn delete(&self, id: &str) -> RegistryResult<bool> {
        let guard = self.lock(id).await;
        let Some(device) = self.get(id).await? else {
            return Ok(false);
        };
        let removed = self.repository.delete(id).await?;
        self.unindex(&device);
        drop(guard);
        self.locks.remove(id);
        info!(id, "Device deleted");
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
    use hub_core::{EventDraft, EventSource};
    use async_trait::async_trait;
    use hub_storage::{MemoryRepository, StorageResult};

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(MemoryRepository::new()))
    }

    /// Yields inside every write, the way file-backed storage does
    struct YieldingRepository(MemoryRepository<Device>);

    #[async_trait]
    impl Repository<Device> for YieldingRepository {
        async fn get(&self, id: &str) -> StorageResult<Option<Device>> {
            self.0.get(id).await
        }

        async fn list(&self) -> StorageResult<Vec<Device>> {
            self.0.list().await
        }

        async fn create(&self, record: Device) -> StorageResult<Device> {
            self.0.create(record).await
        }

        async fn update(&self, record: Device) -> StorageResult<Device> {
            tokio::task::yield_now().await;
            self.0.update(record).await
        }

        async fn delete(&self, id: &str) -> StorageResult<bool> {
            self.0.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_network_id_lookup_is_case_insensitive() {
        let registry = registry();
        let device = registry
            .create(Device::new("def", "Lamp", "0a1b").with_integration("zigbee"))
            .await
            .unwrap();

        let found = registry
            .get_by_network_id(Some("zigbee"), "0A1B")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, device.id);
        assert!(registry
            .get_by_network_id(Some("lan"), "0A1B")
            .await
            .unwrap()
            .is_none());

        let duplicate = registry
            .create(Device::new("def", "Other", "0A1B").with_integration("zigbee"))
            .await;
        assert!(matches!(duplicate, Err(RegistryError::DuplicateNetworkId { .. })));
    }

    #[tokio::test]
    async fn test_update_reindexes_network_id() {
        let registry = registry();
        let device = registry.create(Device::new("def", "Lamp", "aa")).await.unwrap();
        registry
            .update_with(&device.id, |d| d.device_network_id = "bb".to_string())
            .await
            .unwrap();

        assert!(registry.get_by_network_id(None, "aa").await.unwrap().is_none());
        assert!(registry.get_by_network_id(None, "BB").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_children_and_definition_usage() {
        let registry = registry();
        let parent = registry.create(Device::new("hub-def", "Bridge", "p")).await.unwrap();
        registry
            .create(Device::new("bulb-def", "Bulb", "c1").with_parent(&EntityRef::device(&parent.id)))
            .await
            .unwrap();
        registry
            .create(Device::new("bulb-def", "Other", "c2").with_parent(&EntityRef::app("a1")))
            .await
            .unwrap();

        let children = registry.children_of(&EntityRef::device(&parent.id)).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "Bulb");
        assert_eq!(registry.using_definition("bulb-def").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_interleaved_events_keep_both_states() {
        let registry = DeviceRegistry::new(Arc::new(YieldingRepository(MemoryRepository::new())));
        let device = registry.create(Device::new("def", "Dimmer", "aa")).await.unwrap();
        let switch = Event::new(EventDraft::new("switch", "on"), EventSource::Device, &device.id, None);
        let level = Event::new(EventDraft::new("level", "40"), EventSource::Device, &device.id, None);

        let (a, b) = tokio::join!(registry.apply_event(&switch), registry.apply_event(&level));
        a.unwrap();
        b.unwrap();

        let device = registry.require(&device.id).await.unwrap();
        assert_eq!(device.current_value("switch"), Some("on"));
        assert_eq!(device.current_value("level"), Some("40"));
    }

    #[tokio::test]
    async fn test_interleaved_update_with_calls_compose() {
        let registry = DeviceRegistry::new(Arc::new(YieldingRepository(MemoryRepository::new())));
        let device = registry.create(Device::new("def", "Lamp", "aa")).await.unwrap();

        let (a, b) = tokio::join!(
            registry.update_with(&device.id, |d| {
                d.data.insert("model".to_string(), "L1".into());
            }),
            registry.update_with(&device.id, |d| d.label = Some("Porch".to_string())),
        );
        a.unwrap();
        b.unwrap();

        let device = registry.require(&device.id).await.unwrap();
        assert_eq!(device.data.get("model").and_then(|v| v.as_str()), Some("L1"));
        assert_eq!(device.label.as_deref(), Some("Porch"));
    }

    #[tokio::test]
    async fn test_apply_event_records_state() {
        let registry = registry();
        let device = registry.create(Device::new("def", "Lamp", "aa")).await.unwrap();
        let event = Event::new(EventDraft::new("switch", "on"), EventSource::Device, &device.id, None);

        registry.apply_event(&event).await.unwrap();
        let device = registry.require(&device.id).await.unwrap();
        assert_eq!(device.current_value("switch"), Some("on"));

        assert!(registry.delete(&device.id).await.unwrap());
        assert!(registry.get_by_network_id(None, "aa").await.unwrap().is_none());
    }
}
