//! Subscription index
//!
//! Keeps subscriptions in registration order, which is the order matched
//! handlers are invoked in. Structurally equal registrations are ignored.
//! Mutations are serialized, so concurrent registrations of the same
//! subscription store it once.

use std::sync::{Arc, RwLock};

use hub_core::{Event, Subscription};
use hub_storage::Repository;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::error::RuntimeResult;

pub struct SubscriptionDispatcher {
    repository: Arc<dyn Repository<Subscription>>,
    loaded: OnceCell<()>,
    subscriptions: RwLock<Vec<Subscription>>,
    /// Held across check, repository write and index update
    writer: Mutex<()>,
}

impl SubscriptionDispatcher {
    pub fn new(repository: Arc<dyn Repository<Subscription>>) -> Self {
        Self {
            repository,
            loaded: OnceCell::new(),
            subscriptions: RwLock::new(Vec::new()),
            writer: Mutex::new(()),
        }
    }

    async fn ensure_loaded(&self) -> RuntimeResult<()> {
        self.loaded
            .get_or_try_init(|| async {
                let subscriptions = self.repository.list().await?;
                info!(count = subscriptions.len(), "Subscriptions loaded");
                *self.subscriptions.write().unwrap_or_else(|p| p.into_inner()) = subscriptions;
                Ok::<(), crate::error::RuntimeError>(())
            })
            .await?;
        Ok(())
    }

    fn read(&self) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub async fn list(&self) -> RuntimeResult<Vec<Subscription>> {
        self.ensure_loaded().await?;
        Ok(self.read())
    }

    pub async fn for_app(&self, app_id: &str) -> RuntimeResult<Vec<Subscription>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.subscribed_app_id == app_id)
            .collect())
    }

    /// Register a subscription; returns false for a duplicate
    pub async fn add(&self, subscription: Subscription) -> RuntimeResult<bool> {
        self.ensure_loaded().await?;
        let _writer = self.writer.lock().await;
        if self.read().contains(&subscription) {
            debug!(
                app_id = %subscription.subscribed_app_id,
                handler = %subscription.handler_method,
                "Duplicate subscription ignored"
            );
            return Ok(false);
        }
        let subscription = self.repository.create(subscription).await?;
        debug!(
            app_id = %subscription.subscribed_app_id,
            handler = %subscription.handler_method,
            target = ?subscription.target,
            "Subscription added"
        );
        self.subscriptions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(subscription);
        Ok(true)
    }

    /// Remove every subscription `predicate` selects
    pub async fn remove_where<F>(&self, predicate: F) -> RuntimeResult<usize>
    where
        F: Fn(&Subscription) -> bool,
    {
        self.ensure_loaded().await?;
        let _writer = self.writer.lock().await;
        let doomed: Vec<String> = self
            .read()
            .iter()
            .filter(|s| predicate(s))
            .map(|s| s.id.clone())
            .collect();
        for id in &doomed {
            self.repository.delete(id).await?;
        }
        self.subscriptions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|s| !doomed.contains(&s.id));
        Ok(doomed.len())
    }

    /// `unsubscribe()`: all of an app's subscriptions, optionally only those
    /// on some devices or for one handler
    pub async fn unsubscribe(
        &self,
        app_id: &str,
        device_ids: &[String],
        handler: Option<&str>,
    ) -> RuntimeResult<usize> {
        self.remove_where(|s| {
            s.subscribed_app_id == app_id
                && (device_ids.is_empty()
                    || s.device_id().is_some_and(|id| device_ids.iter().any(|d| d == id)))
                && handler.map_or(true, |h| s.handler_method == h)
        })
        .await
    }

    pub async fn remove_for_device(&self, device_id: &str) -> RuntimeResult<usize> {
        self.remove_where(|s| s.device_id() == Some(device_id)).await
    }

    /// Subscriptions matching `event`, in registration order
    ///
    /// A subscription matches when it targets the event's source and its
    /// attribute filter matches, whatever its `filterEvents` flag says.
    pub async fn matching(&self, event: &Event) -> RuntimeResult<Vec<Subscription>> {
        self.ensure_loaded().await?;
        Ok(self
            .read()
            .into_iter()
            .filter(|s| s.targets(event.source, &event.source_id) && s.matches(event))
            .collect())
    }

    /// Matching subscriptions whose `filterEvents` flag lets `event` through
    pub async fn queued_for(&self, event: &Event) -> RuntimeResult<Vec<Subscription>> {
        Ok(self
            .matching(event)
            .await?
            .into_iter()
            .filter(|s| s.accepts(event))
            .collect())
    }

    pub async fn flush(&self) -> RuntimeResult<()> {
        self.repository.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::{EventDraft, EventSource, SubscriptionTarget};
    use async_trait::async_trait;
    use hub_storage::{MemoryRepository, StorageResult};

    /// Yields before every write, so concurrent callers interleave there
    struct YieldingRepository(MemoryRepository<Subscription>);

    #[async_trait]
    impl Repository<Subscription> for YieldingRepository {
        async fn get(&self, id: &str) -> StorageResult<Option<Subscription>> {
            self.0.get(id).await
        }

        async fn list(&self) -> StorageResult<Vec<Subscription>> {
            self.0.list().await
        }

        async fn create(&self, record: Subscription) -> StorageResult<Subscription> {
            tokio::task::yield_now().await;
            self.0.create(record).await
        }

        async fn update(&self, record: Subscription) -> StorageResult<Subscription> {
            tokio::task::yield_now().await;
            self.0.update(record).await
        }

        async fn delete(&self, id: &str) -> StorageResult<bool> {
            tokio::task::yield_now().await;
            self.0.delete(id).await
        }
    }

    fn dispatcher() -> SubscriptionDispatcher {
        SubscriptionDispatcher::new(Arc::new(MemoryRepository::new()))
    }

    fn on_device(device: &str, filter: Option<&str>, handler: &str, app: &str) -> Subscription {
        Subscription::new(
            SubscriptionTarget::Device(device.into()),
            filter.map(str::to_string),
            handler,
            app,
        )
    }

    fn event(device: &str, name: &str, value: &str, state_change: bool) -> Event {
        Event::new(
            EventDraft::new(name, value).force_state_change(state_change),
            EventSource::Device,
            device,
            None,
        )
    }

    #[tokio::test]
    async fn test_duplicates_are_ignored() {
        let dispatcher = dispatcher();
        assert!(dispatcher.add(on_device("d1", Some("switch"), "m1", "a1")).await.unwrap());
        assert!(!dispatcher.add(on_device("d1", Some("switch"), "m1", "a1")).await.unwrap());
        assert!(dispatcher.add(on_device("d1", Some("switch"), "m2", "a1")).await.unwrap());
        assert_eq!(dispatcher.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_are_stored_once() {
        let repository = Arc::new(YieldingRepository(MemoryRepository::new()));
        let dispatcher = SubscriptionDispatcher::new(repository.clone());

        let (first, second) = tokio::join!(
            dispatcher.add(on_device("d1", Some("switch"), "m1", "a1")),
            dispatcher.add(on_device("d1", Some("switch"), "m1", "a1")),
        );
        assert!(first.unwrap() ^ second.unwrap());
        assert_eq!(dispatcher.list().await.unwrap().len(), 1);
        assert_eq!(repository.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_matching_ignores_filter_events() {
        let dispatcher = dispatcher();
        dispatcher.add(on_device("d1", Some("switch"), "m1", "a1")).await.unwrap();

        let repeated = event("d1", "switch", "on", false);
        assert_eq!(dispatcher.matching(&repeated).await.unwrap().len(), 1);
        assert!(dispatcher.queued_for(&repeated).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queued_in_registration_order_with_filter_law() {
        let dispatcher = dispatcher();
        dispatcher.add(on_device("d1", Some("switch"), "first", "a1")).await.unwrap();
        dispatcher.add(on_device("d2", None, "other_device", "a1")).await.unwrap();
        dispatcher
            .add(on_device("d1", None, "every", "a2").with_filter_events(false))
            .await
            .unwrap();
        dispatcher.add(on_device("d1", Some("switch.on"), "on_only", "a3")).await.unwrap();

        let handlers = |subs: Vec<Subscription>| -> Vec<String> {
            subs.into_iter().map(|s| s.handler_method).collect()
        };

        let changed = dispatcher.queued_for(&event("d1", "switch", "on", true)).await.unwrap();
        assert_eq!(handlers(changed), vec!["first", "every", "on_only"]);

        let repeated = dispatcher.queued_for(&event("d1", "switch", "on", false)).await.unwrap();
        assert_eq!(handlers(repeated), vec!["every"]);
    }

    #[tokio::test]
    async fn test_location_subscriptions_match_hub_events() {
        let dispatcher = dispatcher();
        dispatcher
            .add(Subscription::new(
                SubscriptionTarget::Location("home".into()),
                Some("mode".into()),
                "modeChanged",
                "a1",
            ))
            .await
            .unwrap();
        let hub_event = Event::new(EventDraft::new("mode", "Away"), EventSource::Hub, "home", None);
        assert_eq!(dispatcher.queued_for(&hub_event).await.unwrap().len(), 1);
        assert!(dispatcher
            .queued_for(&event("home", "mode", "Away", true))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_scopes() {
        let dispatcher = dispatcher();
        dispatcher.add(on_device("d1", None, "h1", "a1")).await.unwrap();
        dispatcher.add(on_device("d2", None, "h1", "a1")).await.unwrap();
        dispatcher.add(on_device("d2", None, "h2", "a1")).await.unwrap();
        dispatcher.add(on_device("d1", None, "h1", "a2")).await.unwrap();

        assert_eq!(dispatcher.unsubscribe("a1", &["d2".into()], Some("h2")).await.unwrap(), 1);
        assert_eq!(dispatcher.unsubscribe("a1", &[], None).await.unwrap(), 2);
        assert_eq!(dispatcher.remove_for_device("d1").await.unwrap(), 1);
        assert!(dispatcher.list().await.unwrap().is_empty());
    }
}
