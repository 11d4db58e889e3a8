//! Installed smart app instances

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Setting;

/// A per-install instance of a smart app definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledApp {
    pub id: String,
    pub definition_id: String,
    pub label: String,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub settings: Vec<Setting>,
    /// Arbitrary JSON-safe state owned by the app's code
    #[serde(default)]
    pub state: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_installed_app_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl InstalledApp {
    pub fn new(definition_id: impl Into<String>, label: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: crate::new_id(),
            definition_id: definition_id.into(),
            label: label.into(),
            installed: false,
            settings: Vec::new(),
            state: serde_json::Map::new(),
            parent_installed_app_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_settings(mut self, settings: Vec<Setting>) -> Self {
        self.settings = settings;
        self
    }
}
