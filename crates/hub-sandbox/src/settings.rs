//! Typed, memoized view over persisted settings
//!
//! Values are coerced to the declared input type on first read. A
//! `capability.*` setting holds device ids and is resolved to device
//! snapshots through the host. Any miss or unusable value reads as `None`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use hub_core::Setting;
use serde_json::Value;

use crate::host::{DeviceSnapshot, SandboxHost};

/// A setting value after coercion
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Enum(String),
    List(Vec<TypedValue>),
    Device(DeviceSnapshot),
    Devices(Vec<DeviceSnapshot>),
    /// Untyped inputs pass through as JSON
    Json(Value),
}

pub struct SettingsView {
    settings: HashMap<String, Setting>,
    cache: RefCell<HashMap<String, Option<TypedValue>>>,
    host: Arc<dyn SandboxHost>,
}

impl SettingsView {
    pub fn new(settings: &[Setting], host: Arc<dyn SandboxHost>) -> Self {
        Self {
            settings: settings
                .iter()
                .map(|s| (s.name.clone(), s.clone()))
                .collect(),
            cache: RefCell::new(HashMap::new()),
            host,
        }
    }

    pub fn get(&self, name: &str) -> Option<TypedValue> {
        if let Some(cached) = self.cache.borrow().get(name) {
            return cached.clone();
        }
        let value = self
            .settings
            .get(name)
            .and_then(|setting| coerce(setting, self.host.as_ref()));
        self.cache
            .borrow_mut()
            .insert(name.to_string(), value.clone());
        value
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.settings.keys().map(String::as_str)
    }
}

fn coerce(setting: &Setting, host: &dyn SandboxHost) -> Option<TypedValue> {
    if setting.value.is_null() {
        return None;
    }

    if setting.capability().is_some() {
        let ids = device_ids(&setting.value);
        let mut devices: Vec<DeviceSnapshot> = ids.iter().filter_map(|id| host.device(id)).collect();
        return if setting.multiple {
            Some(TypedValue::Devices(devices))
        } else if devices.is_empty() {
            None
        } else {
            Some(TypedValue::Device(devices.swap_remove(0)))
        };
    }

    if setting.multiple {
        if let Value::Array(items) = &setting.value {
            let items = items
                .iter()
                .filter_map(|item| scalar(&setting.setting_type, item))
                .collect();
            return Some(TypedValue::List(items));
        }
        // A single value for a multi-select reads as a one-element list
        return scalar(&setting.setting_type, &setting.value).map(|v| TypedValue::List(vec![v]));
    }

    scalar(&setting.setting_type, &setting.value)
}

fn scalar(setting_type: &str, value: &Value) -> Option<TypedValue> {
    match setting_type {
        "number" | "decimal" => match value {
            Value::Number(n) => n.as_f64().map(TypedValue::Number),
            Value::String(s) => s.trim().parse().ok().map(TypedValue::Number),
            _ => None,
        },
        "bool" | "boolean" => match value {
            Value::Bool(b) => Some(TypedValue::Bool(*b)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => Some(TypedValue::Bool(true)),
                "false" | "0" | "off" => Some(TypedValue::Bool(false)),
                _ => None,
            },
            Value::Number(n) => n.as_i64().map(|n| TypedValue::Bool(n != 0)),
            _ => None,
        },
        "enum" => text(value).map(TypedValue::Enum),
        "text" | "string" | "password" | "email" | "phone" | "time" | "paragraph" | "mode"
        | "icon" | "hub" | "contact" => text(value).map(TypedValue::Text),
        _ => Some(TypedValue::Json(value.clone())),
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn device_ids(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}
