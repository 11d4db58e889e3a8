//! Recent-event store backing `eventsSince`

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hub_core::{Event, EventSource};
use tracing::{debug, info};

use crate::storage::{Storage, StorageFile, StorageResult};

/// Storage key for persisted events
const EVENTS_KEY: &str = "hub.events";
const EVENTS_VERSION: u32 = 1;

/// Default number of events kept per source
pub const DEFAULT_RETAIN_PER_SOURCE: usize = 100;

/// Event persistence port
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: Event) -> StorageResult<()>;

    /// Events of one source newer than `since`, newest first, at most `max`
    async fn since(
        &self,
        source: EventSource,
        source_id: &str,
        since: Option<DateTime<Utc>>,
        max: usize,
    ) -> StorageResult<Vec<Event>>;

    /// Drop every event of a source
    async fn purge(&self, source: EventSource, source_id: &str) -> StorageResult<()>;

    async fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Bounded per-source ring buffers, optionally snapshotted to a JSON file
///
/// Appends stay in memory; `flush` writes the snapshot.
pub struct MemoryEventStore {
    retain_per_source: usize,
    events: DashMap<(EventSource, String), VecDeque<Event>>,
    storage: Option<Arc<Storage>>,
}

impl MemoryEventStore {
    pub fn new(retain_per_source: usize) -> Self {
        Self {
            retain_per_source: retain_per_source.max(1),
            events: DashMap::new(),
            storage: None,
        }
    }

    /// Open with file persistence, loading the last snapshot
    pub async fn open(storage: Arc<Storage>, retain_per_source: usize) -> StorageResult<Self> {
        let mut store = Self::new(retain_per_source);
        if let Some(file) = storage
            .load::<Vec<Event>>(EVENTS_KEY, EVENTS_VERSION)
            .await?
        {
            info!(count = file.data.len(), "Loaded recent events from storage");
            // Snapshot is oldest first
            for event in file.data {
                store.push(event);
            }
        }
        store.storage = Some(storage);
        Ok(store)
    }

    fn push(&self, event: Event) {
        let mut buffer = self
            .events
            .entry((event.source, event.source_id.clone()))
            .or_default();
        buffer.push_back(event);
        while buffer.len() > self.retain_per_source {
            buffer.pop_front();
        }
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETAIN_PER_SOURCE)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: Event) -> StorageResult<()> {
        self.push(event);
        Ok(())
    }

    async fn since(
        &self,
        source: EventSource,
        source_id: &str,
        since: Option<DateTime<Utc>>,
        max: usize,
    ) -> StorageResult<Vec<Event>> {
        let Some(buffer) = self.events.get(&(source, source_id.to_string())) else {
            return Ok(Vec::new());
        };
        Ok(buffer
            .iter()
            .rev()
            .filter(|e| since.map_or(true, |s| e.date > s))
            .take(max)
            .cloned()
            .collect())
    }

    async fn purge(&self, source: EventSource, source_id: &str) -> StorageResult<()> {
        self.events.remove(&(source, source_id.to_string()));
        Ok(())
    }

    async fn flush(&self) -> StorageResult<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let mut all: Vec<Event> = self
            .events
            .iter()
            .flat_map(|r| r.value().iter().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by_key(|e| e.date);
        debug!(count = all.len(), "Flushing recent events");
        storage
            .save(&StorageFile::new(EVENTS_KEY, all, EVENTS_VERSION))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::EventDraft;
    use tempfile::TempDir;

    fn event(source_id: &str, value: &str) -> Event {
        Event::new(
            EventDraft::new("switch", value),
            EventSource::Device,
            source_id,
            None,
        )
    }

    #[tokio::test]
    async fn test_since_is_newest_first_and_bounded() {
        let store = MemoryEventStore::new(3);
        for v in ["1", "2", "3", "4"] {
            store.append(event("d1", v)).await.unwrap();
        }
        store.append(event("d2", "x")).await.unwrap();

        let events = store.since(EventSource::Device, "d1", None, 10).await.unwrap();
        let values: Vec<&str> = events.iter().map(|e| e.value.as_str()).collect();
        assert_eq!(values, vec!["4", "3", "2"]);

        let limited = store.since(EventSource::Device, "d1", None, 1).await.unwrap();
        assert_eq!(limited[0].value, "4");
    }

    #[tokio::test]
    async fn test_since_filters_by_date() {
        let store = MemoryEventStore::default();
        let old = event("d1", "old");
        let cutoff = old.date;
        store.append(old).await.unwrap();
        let mut new = event("d1", "new");
        new.date = cutoff + chrono::Duration::seconds(1);
        store.append(new).await.unwrap();

        let events = store
            .since(EventSource::Device, "d1", Some(cutoff), 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].value, "new");
    }

    #[tokio::test]
    async fn test_flush_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));

        let store = MemoryEventStore::open(storage.clone(), 10).await.unwrap();
        store.append(event("d1", "on")).await.unwrap();
        store.flush().await.unwrap();

        let reopened = MemoryEventStore::open(storage, 10).await.unwrap();
        let events = reopened.since(EventSource::Device, "d1", None, 10).await.unwrap();
        assert_eq!(events.len(), 1);
    }
}
