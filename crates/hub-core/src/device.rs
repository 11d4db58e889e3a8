//! Devices and their per-attribute state records

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EntityRef, Setting};

/// The latest recorded value of one device attribute
///
/// One record per attribute name per device; replaced wholesale on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    pub id: String,
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub date: DateTime<Utc>,
}

/// Integration a device is attached to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationRef {
    pub id: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

/// Routing identity key: `(integrationId | "null") + ":" + upper(dni)`
pub fn identity_key(integration_id: Option<&str>, device_network_id: &str) -> String {
    format!(
        "{}:{}",
        integration_id.unwrap_or("null"),
        device_network_id.to_uppercase()
    )
}

/// A physical or virtual device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    /// Device handler definition id
    pub definition_id: String,
    pub name: String,
    /// Display override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Protocol-level address, case-insensitive
    pub device_network_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_installed_app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration: Option<IntegrationRef>,
    /// Opaque driver data
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub settings: Vec<Setting>,
    #[serde(default)]
    pub current_states: BTreeMap<String, StateRecord>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Create a new device with a fresh id
    pub fn new(
        definition_id: impl Into<String>,
        name: impl Into<String>,
        device_network_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: crate::new_id(),
            definition_id: definition_id.into(),
            name: name.into(),
            label: None,
            device_network_id: device_network_id.into(),
            parent_device_id: None,
            parent_installed_app_id: None,
            integration: None,
            data: serde_json::Map::new(),
            settings: Vec::new(),
            current_states: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_integration(mut self, integration_id: impl Into<String>) -> Self {
        self.integration = Some(IntegrationRef {
            id: integration_id.into(),
            options: serde_json::Value::Null,
        });
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Attach to a parent entity; a device has at most one parent
    pub fn with_parent(mut self, parent: &EntityRef) -> Self {
        match parent.entity_type {
            crate::EntityType::Device => {
                self.parent_device_id = Some(parent.entity_id.clone());
                self.parent_installed_app_id = None;
            }
            crate::EntityType::SmartApp => {
                self.parent_installed_app_id = Some(parent.entity_id.clone());
                self.parent_device_id = None;
            }
        }
        self
    }

    /// The parent entity, if any
    pub fn parent(&self) -> Option<EntityRef> {
        self.parent_device_id
            .as_ref()
            .map(EntityRef::device)
            .or_else(|| self.parent_installed_app_id.as_ref().map(EntityRef::app))
    }

    pub fn integration_id(&self) -> Option<&str> {
        self.integration.as_ref().map(|i| i.id.as_str())
    }

    pub fn identity_key(&self) -> String {
        identity_key(self.integration_id(), &self.device_network_id)
    }

    /// Label if set, otherwise name
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    pub fn current_value(&self, attribute: &str) -> Option<&str> {
        self.current_states.get(attribute).map(|s| s.value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key_is_case_insensitive() {
        let a = Device::new("def", "Lamp", "0a1b").with_integration("zigbee");
        let b = Device::new("def", "Lamp", "0A1B").with_integration("zigbee");
        assert_eq!(a.identity_key(), b.identity_key());
        assert_eq!(a.identity_key(), "zigbee:0A1B");
        assert_eq!(identity_key(None, "x"), "null:X");
    }

    #[test]
    fn test_parent_is_exclusive() {
        let device = Device::new("def", "Child", "c1")
            .with_parent(&EntityRef::device("p1"))
            .with_parent(&EntityRef::app("a1"));
        assert!(device.parent_device_id.is_none());
        assert_eq!(device.parent(), Some(EntityRef::app("a1")));
    }
}
