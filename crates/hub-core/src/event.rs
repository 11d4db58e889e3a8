//! Events routed through the entity runtime

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::StateRecord;

/// Origin of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventSource {
    /// Emitted by a device handler (`sendEvent`)
    Device,
    /// Emitted for the hub's location (`sendLocationEvent`, mode changes)
    Hub,
    /// Emitted by an installed smart app about itself
    Isa,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventSource::Device => "DEVICE",
            EventSource::Hub => "HUB",
            EventSource::Isa => "ISA",
        };
        f.write_str(s)
    }
}

/// What code asked to emit, before the runtime stamps it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDraft {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_text: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Explicit override of the computed state-change flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_state_change: Option<bool>,
}

impl EventDraft {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn force_state_change(mut self, is_state_change: bool) -> Self {
        self.is_state_change = Some(is_state_change);
        self
    }
}

/// A stamped event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_text: Option<String>,
    pub source: EventSource,
    pub source_id: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
    is_state_change: bool,
}

impl Event {
    /// Stamp a draft
    ///
    /// `prior` is the currently recorded state for `(source_id, draft.name)`.
    /// The event is a state change when there is no prior record or its value
    /// differs, unless the draft overrides the flag.
    pub fn new(
        draft: EventDraft,
        source: EventSource,
        source_id: impl Into<String>,
        prior: Option<&StateRecord>,
    ) -> Self {
        let computed = prior.map(|p| p.value != draft.value).unwrap_or(true);
        Self {
            id: Ulid::new().to_string(),
            name: draft.name,
            value: draft.value,
            unit: draft.unit,
            description_text: draft.description_text,
            source,
            source_id: source_id.into(),
            date: Utc::now(),
            data: draft.data,
            is_state_change: draft.is_state_change.unwrap_or(computed),
        }
    }

    pub fn is_state_change(&self) -> bool {
        self.is_state_change
    }

    /// The state record this event produces for its source device
    pub fn to_state_record(&self) -> StateRecord {
        StateRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            value: self.value.clone(),
            unit: self.unit.clone(),
            date: self.date,
        }
    }
}
