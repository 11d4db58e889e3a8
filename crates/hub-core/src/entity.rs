//! Entity addressing: `(entityType, entityId)`

use serde::{Deserialize, Serialize};

/// Kind of entity that owns code, subscriptions and schedules
///
/// Used as the dispatch and scheduling namespace key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityType {
    /// A device, driven by a device handler
    Device,
    /// An installed smart app
    #[serde(rename = "SMARTAPP")]
    SmartApp,
}

impl EntityType {
    /// Get the namespace tag as used in job keys
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Device => "DEVICE",
            EntityType::SmartApp => "SMARTAPP",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEVICE" => Ok(EntityType::Device),
            "SMARTAPP" | "APP" => Ok(EntityType::SmartApp),
            other => Err(format!("unknown entity type: {}", other)),
        }
    }
}

/// Reference to a concrete entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityRef {
    pub fn device(id: impl Into<String>) -> Self {
        Self {
            entity_type: EntityType::Device,
            entity_id: id.into(),
        }
    }

    pub fn app(id: impl Into<String>) -> Self {
        Self {
            entity_type: EntityType::SmartApp,
            entity_id: id.into(),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_serde_tags() {
        assert_eq!(
            serde_json::to_string(&EntityType::SmartApp).unwrap(),
            "\"SMARTAPP\""
        );
        assert_eq!(
            serde_json::from_str::<EntityType>("\"DEVICE\"").unwrap(),
            EntityType::Device
        );
        assert_eq!("smartapp".parse::<EntityType>().unwrap(), EntityType::SmartApp);
    }
}
