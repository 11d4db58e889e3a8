//! Subscriptions linking event patterns to app handlers

use serde::{Deserialize, Serialize};

use crate::{Event, EventSource};

/// What a subscription listens to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionTarget {
    Device(String),
    Location(String),
}

/// A registration of `subscribedAppId.handlerMethod` for matching events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub target: SubscriptionTarget,
    /// `"name"` or `"name.value"`; unset matches every event of the target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_filter: Option<String>,
    pub handler_method: String,
    pub subscribed_app_id: String,
    #[serde(default = "default_filter_events")]
    pub filter_events: bool,
}

fn default_filter_events() -> bool {
    true
}

impl PartialEq for Subscription {
    /// Structural equality over every field except the generated id
    fn eq(&self, other: &Self) -> bool {
        self.target == other.target
            && self.attribute_filter == other.attribute_filter
            && self.handler_method == other.handler_method
            && self.subscribed_app_id == other.subscribed_app_id
            && self.filter_events == other.filter_events
    }
}

impl Subscription {
    pub fn new(
        target: SubscriptionTarget,
        attribute_filter: Option<String>,
        handler_method: impl Into<String>,
        subscribed_app_id: impl Into<String>,
    ) -> Self {
        Self {
            id: crate::new_id(),
            target,
            attribute_filter,
            handler_method: handler_method.into(),
            subscribed_app_id: subscribed_app_id.into(),
            filter_events: true,
        }
    }

    pub fn with_filter_events(mut self, filter_events: bool) -> Self {
        self.filter_events = filter_events;
        self
    }

    pub fn device_id(&self) -> Option<&str> {
        match &self.target {
            SubscriptionTarget::Device(id) => Some(id),
            SubscriptionTarget::Location(_) => None,
        }
    }

    /// Attribute filter rule: unset, `name`, or `name.value`
    pub fn matches(&self, event: &Event) -> bool {
        match self.attribute_filter.as_deref() {
            None | Some("") => true,
            Some(filter) => {
                filter == event.name || filter == format!("{}.{}", event.name, event.value)
            }
        }
    }

    /// Whether a matching event should be delivered to the handler
    pub fn accepts(&self, event: &Event) -> bool {
        !self.filter_events || event.is_state_change()
    }

    /// Whether this subscription is a candidate for the given event source
    pub fn targets(&self, source: EventSource, source_id: &str) -> bool {
        match (&self.target, source) {
            (SubscriptionTarget::Device(id), EventSource::Device) => id == source_id,
            (SubscriptionTarget::Location(_), EventSource::Hub) => true,
            _ => false,
        }
    }
}
