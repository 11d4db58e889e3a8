//! Persisted user settings of a device or installed app

use serde::{Deserialize, Serialize};

/// A single persisted setting
///
/// `value` is stored as raw JSON; coercion to the declared `type` happens
/// lazily when running code reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    pub name: String,
    #[serde(default)]
    pub value: serde_json::Value,
    /// Declared input type, e.g. `text`, `number`, `bool`, `enum`, `capability.switch`
    #[serde(rename = "type", default = "default_type")]
    pub setting_type: String,
    #[serde(default)]
    pub multiple: bool,
}

fn default_type() -> String {
    "text".to_string()
}

impl Setting {
    pub fn new(
        name: impl Into<String>,
        setting_type: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            setting_type: setting_type.into(),
            multiple: false,
        }
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    /// Capability name for `capability.*` settings
    pub fn capability(&self) -> Option<&str> {
        self.setting_type.strip_prefix("capability.")
    }
}
