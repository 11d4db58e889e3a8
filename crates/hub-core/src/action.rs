//! Protocol actions emitted by device handlers
//!
//! A driver method may return a string, a list, a tagged action table or
//! nothing. That value is decoded once, at the sandbox boundary, into the
//! closed [`Action`] union and then flattened into ordered [`Step`]s.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Command prefixes that identify a Zigbee command string
const ZIGBEE_PREFIXES: [&str; 5] = ["st ", "he ", "ph ", "raw ", "zdo "];

/// Wire protocol of an outbound action
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Zigbee,
    Lan,
    Zwave,
    #[serde(untagged)]
    Other(String),
}

impl Protocol {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "zigbee" => Protocol::Zigbee,
            "lan" => Protocol::Lan,
            "zwave" => Protocol::Zwave,
            other => Protocol::Other(other.to_string()),
        }
    }
}

/// An outbound protocol-addressed command destined for an integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubAction {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dni: Option<String>,
    #[serde(default)]
    pub options: Value,
}

impl HubAction {
    pub fn new(action: impl Into<String>, protocol: Option<Protocol>) -> Self {
        Self {
            action: action.into(),
            protocol,
            dni: None,
            options: Value::Null,
        }
    }
}

/// Response from an integration for a processed action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubResponse {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub body: Value,
}

/// Decoded driver return value
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Command(HubAction),
    Delay(Duration),
    Sequence(Vec<Action>),
}

/// One element of a flattened action sequence
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Send(HubAction),
    Pause(Duration),
}

/// A returned value with a shape no action can be decoded from
#[derive(Debug, Clone, Error, PartialEq)]
#[error("unhandled action value: {0}")]
pub struct ActionDecodeError(pub String);

impl Action {
    /// Decode a driver return value
    ///
    /// `null` decodes to `None`. Unhandled elements inside a list are logged
    /// and skipped; an unhandled top-level value is an error.
    pub fn decode(value: &Value) -> Result<Option<Action>, ActionDecodeError> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(Self::decode_str(s))),
            Value::Array(items) => Ok(Some(Action::Sequence(Self::decode_items(items)))),
            Value::Object(map) => {
                // Structured multi-action
                if let Some(Value::Array(items)) = map.get("actions") {
                    return Ok(Some(Action::Sequence(Self::decode_items(items))));
                }
                if let Some(Value::String(action)) = map.get("action") {
                    let protocol = map
                        .get("protocol")
                        .and_then(Value::as_str)
                        .map(Protocol::parse)
                        .or_else(|| Self::protocol_for(action));
                    return Ok(Some(Action::Command(HubAction {
                        action: action.clone(),
                        protocol,
                        dni: map.get("dni").and_then(Value::as_str).map(str::to_string),
                        options: map.get("options").cloned().unwrap_or(Value::Null),
                    })));
                }
                Err(ActionDecodeError(value.to_string()))
            }
            other => Err(ActionDecodeError(other.to_string())),
        }
    }

    fn decode_items(items: &[Value]) -> Vec<Action> {
        items
            .iter()
            .filter_map(|item| match Self::decode(item) {
                Ok(action) => action,
                Err(e) => {
                    warn!(error = %e, "Skipping unhandled action element");
                    None
                }
            })
            .collect()
    }

    fn decode_str(s: &str) -> Action {
        if let Some(delay) = parse_delay(s) {
            return Action::Delay(delay);
        }
        Action::Command(HubAction::new(s, Self::protocol_for(s)))
    }

    fn protocol_for(action: &str) -> Option<Protocol> {
        let lower = action.trim_start().to_ascii_lowercase();
        ZIGBEE_PREFIXES
            .iter()
            .any(|p| lower.starts_with(p))
            .then_some(Protocol::Zigbee)
    }

    /// Flatten into the ordered send/pause steps
    ///
    /// A lone delay is a placeholder and flattens to nothing.
    pub fn into_steps(self) -> Vec<Step> {
        match self {
            Action::Delay(_) => Vec::new(),
            other => {
                let mut steps = Vec::new();
                other.flatten_into(&mut steps);
                steps
            }
        }
    }

    fn flatten_into(self, steps: &mut Vec<Step>) {
        match self {
            Action::Command(action) => steps.push(Step::Send(action)),
            Action::Delay(d) => steps.push(Step::Pause(d)),
            Action::Sequence(items) => {
                for item in items {
                    item.flatten_into(steps);
                }
            }
        }
    }
}

/// `delay N` with N in milliseconds
fn parse_delay(s: &str) -> Option<Duration> {
    let rest = s.trim().strip_prefix("delay")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    rest.trim().parse::<u64>().ok().map(Duration::from_millis)
}
