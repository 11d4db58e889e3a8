//! YAML configuration loading for the hub
//!
//! `hub.yaml` is plain YAML with a few custom tags:
//!
//! - `!include path` - Include another YAML file
//! - `!secret key` - Substitute from secrets.yaml
//! - `!env_var VAR` - Environment variable substitution
//!
//! # Example
//!
//! ```ignore
//! use hub_config::HubConfig;
//!
//! // Missing file yields the defaults
//! let config = HubConfig::load("/etc/hub")?;
//! let drivers = config.drivers_path();
//! ```

mod config;
mod error;
mod loader;
mod secrets;

pub use config::{
    EventsConfig, FingerprintConfig, HubConfig, LocationConfig, SandboxSettings, CONFIG_FILE,
};
pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, load_yaml_string, YamlLoader};
pub use secrets::Secrets;

// Re-export serde_yaml::Value for convenience
pub use serde_yaml::Value;
