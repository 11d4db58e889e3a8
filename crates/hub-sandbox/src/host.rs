//! Host services reachable from running scripts
//!
//! Primitives that must hand a value back to the script call the host
//! synchronously. The engine runs scripts on a blocking thread, so a host
//! implementation is free to block on async work.

use std::collections::BTreeMap;

use hub_core::{Device, EntityRef, StateRecord};
use serde::{Deserialize, Serialize};

/// Read-only view of a device handed to scripts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub id: String,
    pub name: String,
    pub label: Option<String>,
    pub device_network_id: String,
    pub definition_id: String,
    pub capabilities: Vec<String>,
    /// Commands the device's handler exposes
    pub commands: Vec<String>,
    pub current_states: BTreeMap<String, StateRecord>,
    pub data: serde_json::Map<String, serde_json::Value>,
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl DeviceSnapshot {
    /// Snapshot a device with the capability surface of its handler
    pub fn from_device(device: &Device, capabilities: Vec<String>, commands: Vec<String>) -> Self {
        Self {
            id: device.id.clone(),
            name: device.name.clone(),
            label: device.label.clone(),
            device_network_id: device.device_network_id.clone(),
            definition_id: device.definition_id.clone(),
            capabilities,
            commands,
            current_states: device.current_states.clone(),
            data: device.data.clone(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    pub fn current_value(&self, attribute: &str) -> Option<&str> {
        self.current_states.get(attribute).map(|s| s.value.as_str())
    }

    pub fn has_capability(&self, name: &str) -> bool {
        let wanted = normalize(name);
        self.capabilities.iter().any(|c| normalize(c) == wanted)
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.iter().any(|c| c == name)
    }
}

/// The hub's location as seen by scripts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub mode: String,
}

impl Default for LocationInfo {
    fn default() -> Self {
        Self {
            id: "location".to_string(),
            name: "Home".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            mode: "Home".to_string(),
        }
    }
}

/// `addChildDevice` arguments
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChildDeviceRequest {
    pub namespace: String,
    pub type_name: String,
    pub device_network_id: String,
    pub label: Option<String>,
    pub name: Option<String>,
    pub data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Outbound request built from `httpGet`/`httpPost` parameters
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub uri: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Value-returning services a script can call
pub trait SandboxHost: Send + Sync {
    fn device(&self, id: &str) -> Option<DeviceSnapshot>;

    fn child_devices(&self, parent: &EntityRef) -> Vec<DeviceSnapshot>;

    /// Create a child device; errors are reported to the script as messages
    fn add_child_device(
        &self,
        parent: &EntityRef,
        request: ChildDeviceRequest,
    ) -> Result<DeviceSnapshot, String>;

    fn http(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}

/// Host with nothing behind it, used for definition extraction
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl SandboxHost for NullHost {
    fn device(&self, _id: &str) -> Option<DeviceSnapshot> {
        None
    }

    fn child_devices(&self, _parent: &EntityRef) -> Vec<DeviceSnapshot> {
        Vec::new()
    }

    fn add_child_device(
        &self,
        _parent: &EntityRef,
        _request: ChildDeviceRequest,
    ) -> Result<DeviceSnapshot, String> {
        Err("child devices are unavailable here".to_string())
    }

    fn http(&self, _request: HttpRequest) -> Result<HttpResponse, String> {
        Err("http is unavailable here".to_string())
    }
}
