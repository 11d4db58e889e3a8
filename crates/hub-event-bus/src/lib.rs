//! Broadcast bus for live event taps
//!
//! Every event that reaches the entity runtime is broadcast here before the
//! persist/dispatch decision, so passive listeners (WebSocket bridges, log
//! tails) see traffic that is otherwise dropped. Listeners can follow all
//! events or only those of one source entity.

use dashmap::DashMap;
use hub_core::Event;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default channel capacity for event subscriptions
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// The event bus for live listeners
pub struct EventBus {
    /// Senders keyed by source entity id
    by_source: DashMap<String, broadcast::Sender<Event>>,
    /// Sender for listeners of every event
    match_all_sender: broadcast::Sender<Event>,
    /// Channel capacity
    capacity: usize,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with specified channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (match_all_sender, _) = broadcast::channel(capacity);
        Self {
            by_source: DashMap::new(),
            match_all_sender,
            capacity,
        }
    }

    /// Subscribe to events emitted by one source entity
    pub fn subscribe_source(&self, source_id: impl Into<String>) -> broadcast::Receiver<Event> {
        let source_id = source_id.into();
        trace!(source_id = %source_id, "Subscribing to event source");

        self.by_source
            .entry(source_id)
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(self.capacity);
                tx
            })
            .subscribe()
    }

    /// Subscribe to all events
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.match_all_sender.subscribe()
    }

    /// Broadcast an event to its source listeners and all-event listeners
    pub fn fire(&self, event: &Event) {
        debug!(name = %event.name, source_id = %event.source_id, "Broadcasting event");

        if let Some(sender) = self.by_source.get(&event.source_id) {
            // Send errors only mean there are no active receivers
            let _ = sender.send(event.clone());
        }

        let _ = self.match_all_sender.send(event.clone());
    }

    /// Drop per-source channels nobody listens to anymore
    pub fn prune(&self) {
        self.by_source.retain(|_, tx| tx.receiver_count() > 0);
    }

    /// Get the number of per-source channels
    pub fn source_count(&self) -> usize {
        self.by_source.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for EventBus
pub type SharedEventBus = Arc<EventBus>;
