//! Driver and app definitions extracted from entity source

use serde::{Deserialize, Serialize};

use crate::Fingerprint;

/// Which kind of source a definition was extracted from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DefinitionKind {
    DeviceHandler,
    SmartApp,
}

impl DefinitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefinitionKind::DeviceHandler => "deviceHandler",
            DefinitionKind::SmartApp => "smartApp",
        }
    }
}

impl std::fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A custom command declared by a driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }
}

/// A declared user input (`input` inside `preferences`/`section`/`page`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preference {
    pub name: String,
    #[serde(rename = "type")]
    pub input_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// A device handler or smart app definition
///
/// Immutable once loaded. Reprocessing the same source keeps `id` when the
/// new definition is [`equivalent`](DriverDefinition::equivalent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverDefinition {
    pub id: String,
    pub kind: DefinitionKind,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Capability names in declaration order
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(default)]
    pub fingerprints: Vec<Fingerprint>,
    #[serde(default)]
    pub preferences: Vec<Preference>,
    /// Reference to the source text in the source store
    pub source_id: String,
}

impl DriverDefinition {
    /// Field-wise equality ignoring the id
    pub fn equivalent(&self, other: &DriverDefinition) -> bool {
        self.kind == other.kind
            && self.name == other.name
            && self.namespace == other.namespace
            && self.author == other.author
            && self.description == other.description
            && self.capabilities == other.capabilities
            && self.commands == other.commands
            && self.fingerprints == other.fingerprints
            && self.preferences == other.preferences
            && self.source_id == other.source_id
    }

    /// `(namespace, name)` key used to look definitions up by type name
    pub fn type_key(&self) -> (String, String) {
        (self.namespace.to_lowercase(), self.name.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(id: &str) -> DriverDefinition {
        DriverDefinition {
            id: id.to_string(),
            kind: DefinitionKind::DeviceHandler,
            name: "Zigbee Switch".to_string(),
            namespace: "hub".to_string(),
            author: "hub".to_string(),
            description: None,
            capabilities: vec!["Switch".to_string()],
            commands: vec![],
            fingerprints: vec![],
            preferences: vec![],
            source_id: "zigbee-switch".to_string(),
        }
    }

    #[test]
    fn test_equivalent_ignores_id() {
        let a = definition("a");
        let mut b = definition("b");
        assert!(a.equivalent(&b));

        b.capabilities.push("Refresh".to_string());
        assert!(!a.equivalent(&b));
    }
}
