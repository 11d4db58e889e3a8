//! Capability catalog and per-driver projection
//!
//! The catalog is embedded YAML. A driver's projection is the union of the
//! attributes and commands its declared capabilities contribute plus its own
//! custom commands.

use std::collections::HashMap;

use hub_core::{Command, DriverDefinition};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RegistryError, RegistryResult};

const BUILTIN_CATALOG: &str = include_str!("../capabilities.yaml");

/// An attribute contributed by a capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_attribute_type")]
    pub attribute_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

fn default_attribute_type() -> String {
    "STRING".to_string()
}

/// One catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDefinition {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<AttributeSpec>,
    #[serde(default)]
    pub commands: Vec<Command>,
}

/// Capability names compare on lowercase alphanumerics only
/// (`"Switch Level"`, `"switchLevel"` and `"capability.switchLevel"` all match)
fn normalize(name: &str) -> String {
    let name = name.strip_prefix("capability.").unwrap_or(name);
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Lookup table of known capabilities
#[derive(Debug, Clone, Default)]
pub struct CapabilityCatalog {
    by_name: HashMap<String, CapabilityDefinition>,
}

impl CapabilityCatalog {
    /// The catalog shipped with the hub
    pub fn builtin() -> RegistryResult<Self> {
        Self::from_yaml(BUILTIN_CATALOG)
    }

    pub fn from_yaml(text: &str) -> RegistryResult<Self> {
        let entries: Vec<CapabilityDefinition> =
            serde_yaml::from_str(text).map_err(|e| RegistryError::Catalog(e.to_string()))?;
        Ok(Self::from_definitions(entries))
    }

    pub fn from_definitions(entries: impl IntoIterator<Item = CapabilityDefinition>) -> Self {
        let by_name = entries
            .into_iter()
            .map(|def| (normalize(&def.name), def))
            .collect();
        Self { by_name }
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityDefinition> {
        self.by_name.get(&normalize(name))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Compute the attribute and command surface of a definition
    pub fn project(&self, definition: &DriverDefinition) -> CapabilityProjection {
        let mut projection = CapabilityProjection {
            capabilities: definition.capabilities.clone(),
            ..Default::default()
        };

        for capability in &definition.capabilities {
            let Some(entry) = self.get(capability) else {
                warn!(
                    definition = %definition.name,
                    capability = %capability,
                    "Unknown capability"
                );
                continue;
            };
            for attribute in &entry.attributes {
                if !projection.attributes.iter().any(|a| a.name == attribute.name) {
                    projection.attributes.push(attribute.clone());
                }
            }
            for command in &entry.commands {
                projection.push_command(command);
            }
        }
        for command in &definition.commands {
            projection.push_command(command);
        }
        projection
    }
}

/// Attributes and commands a device handler exposes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityProjection {
    pub capabilities: Vec<String>,
    pub attributes: Vec<AttributeSpec>,
    pub commands: Vec<Command>,
}

impl CapabilityProjection {
    fn push_command(&mut self, command: &Command) {
        if !self.has_command(&command.name) {
            self.commands.push(command.clone());
        }
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.iter().any(|c| c.name == name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
    }

    pub fn has_capability(&self, name: &str) -> bool {
        let wanted = normalize(name);
        self.capabilities.iter().any(|c| normalize(c) == wanted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::DefinitionKind;

    fn definition(capabilities: &[&str], commands: &[&str]) -> DriverDefinition {
        DriverDefinition {
            id: "d1".to_string(),
            kind: DefinitionKind::DeviceHandler,
            name: "Dimmer".to_string(),
            namespace: "test".to_string(),
            author: String::new(),
            description: None,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            commands: commands.iter().map(|c| Command::new(*c)).collect(),
            fingerprints: Vec::new(),
            preferences: Vec::new(),
            source_id: "dimmer".to_string(),
        }
    }

    #[test]
    fn test_builtin_catalog_parses() {
        let catalog = CapabilityCatalog::builtin().unwrap();
        assert!(!catalog.is_empty());
        assert!(catalog.get("Switch").is_some());
        assert!(catalog.get("switchLevel").is_some());
        assert!(catalog.get("capability.motionSensor").is_some());
    }

    #[test]
    fn test_projection_unions_capabilities_and_custom_commands() {
        let catalog = CapabilityCatalog::builtin().unwrap();
        let projection = catalog.project(&definition(
            &["Switch", "Switch Level", "Refresh", "Made Up"],
            &["blink", "on"],
        ));

        let commands: Vec<_> = projection.commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(commands, vec!["on", "off", "setLevel", "refresh", "blink"]);
        assert!(projection.has_attribute("switch"));
        assert!(projection.has_attribute("level"));
        assert!(projection.has_capability("switchLevel"));
        assert!(!projection.has_capability("lock"));
    }

    #[test]
    fn test_invalid_catalog_is_an_error() {
        assert!(matches!(
            CapabilityCatalog::from_yaml("{not: [a list"),
            Err(RegistryError::Catalog(_))
        ));
    }
}
