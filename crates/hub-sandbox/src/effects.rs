//! Deferred side effects recorded by fire-and-forget primitives
//!
//! Scripts run to completion without touching the hub. Every primitive that
//! only enqueues work appends an [`Effect`]; the runtime applies them in order
//! once the call returns.

use std::cell::RefCell;
use std::time::Duration;

use hub_core::{Action, EventDraft, SubscriptionTarget};
use serde_json::Value;

/// When a recurring job fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleSpec {
    /// Cron expression or parseable date string
    Expression(String),
    /// Epoch milliseconds; recurs daily at that time of day
    Timestamp(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// `sendEvent(map)` from a device, or `sendEvent(child, map)`
    SendEvent {
        /// Target device; `None` means the calling device
        device_id: Option<String>,
        draft: EventDraft,
    },
    /// `sendLocationEvent(map)`
    SendLocationEvent(EventDraft),
    Subscribe {
        target: SubscriptionTarget,
        attribute_filter: Option<String>,
        handler: String,
        filter_events: bool,
    },
    /// `unsubscribe()` with an optional device or handler restriction
    Unsubscribe {
        device_ids: Vec<String>,
        handler: Option<String>,
    },
    RunIn {
        delay: Duration,
        handler: String,
        overwrite: bool,
        data: Value,
    },
    Schedule {
        schedule: ScheduleSpec,
        handler: String,
        overwrite: bool,
        data: Value,
    },
    /// `unschedule()` or `unschedule(handler)`
    Unschedule { handler: Option<String> },
    /// Command on another device through its handle
    InvokeCommand {
        device_id: String,
        command: String,
        args: Vec<Value>,
    },
    SendHubCommand(Action),
    UpdateDataValue { name: String, value: Value },
}

/// Ordered effect buffer for one invocation
#[derive(Debug, Default)]
pub struct EffectLog {
    effects: RefCell<Vec<Effect>>,
}

impl EffectLog {
    pub fn push(&self, effect: Effect) {
        self.effects.borrow_mut().push(effect);
    }

    pub fn len(&self) -> usize {
        self.effects.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self) -> Vec<Effect> {
        std::mem::take(&mut *self.effects.borrow_mut())
    }
}
