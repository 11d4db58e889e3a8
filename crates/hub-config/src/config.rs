//! Typed hub configuration
//!
//! Parses `hub.yaml` from the config directory. Every key has a default, so
//! an absent file or an empty document is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::loader::YamlLoader;

/// Name of the configuration file inside the config directory
pub const CONFIG_FILE: &str = "hub.yaml";

/// Root of `hub.yaml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Directory for JSON storage (devices, apps, subscriptions, jobs, events)
    pub data_dir: PathBuf,
    /// Directory holding `*.lua` device handler sources
    pub drivers_dir: PathBuf,
    /// Directory holding `*.lua` smart app sources
    pub apps_dir: PathBuf,
    pub location: LocationConfig,
    pub sandbox: SandboxSettings,
    pub events: EventsConfig,
    pub fingerprint: FingerprintConfig,
    /// Tracing filter used when `RUST_LOG` is not set
    pub log_level: String,

    /// Directory the file was loaded from; relative paths resolve against it
    #[serde(skip)]
    config_dir: PathBuf,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".hub"),
            drivers_dir: PathBuf::from("drivers"),
            apps_dir: PathBuf::from("apps"),
            location: LocationConfig::default(),
            sandbox: SandboxSettings::default(),
            events: EventsConfig::default(),
            fingerprint: FingerprintConfig::default(),
            log_level: "info".to_string(),
            config_dir: PathBuf::from("."),
        }
    }
}

/// The single location entity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Fixed location id; generated once and kept in the data directory when absent
    pub id: Option<String>,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            id: None,
            name: "Home".to_string(),
            latitude: 0.0,
            longitude: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Wall-clock bound on a single script invocation
    pub timeout_secs: u64,
    /// VM instructions allowed per invocation
    pub instruction_budget: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            instruction_budget: 50_000_000,
        }
    }
}

impl SandboxSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Recent events kept per source for `eventsSince`
    pub retain_per_source: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            retain_per_source: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Driver used for joins no fingerprint accepts
    pub fallback_driver: String,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            fallback_driver: hub_core::names::UNKNOWN_DRIVER.to_string(),
        }
    }
}

impl HubConfig {
    /// Load `hub.yaml` from `config_dir`, falling back to defaults when absent
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref();
        let path = config_dir.join(CONFIG_FILE);

        let mut config = if path.exists() {
            let mut loader = YamlLoader::new(config_dir)?;
            let value = loader.load_file(CONFIG_FILE)?;
            Self::from_value(value, &path)?
        } else {
            info!(path = %path.display(), "No hub.yaml found, using defaults");
            Self::default()
        };
        config.config_dir = config_dir.to_path_buf();
        config.validate()?;

        debug!(
            data_dir = %config.data_path().display(),
            drivers_dir = %config.drivers_path().display(),
            apps_dir = %config.apps_path().display(),
            "Loaded hub configuration"
        );
        Ok(config)
    }

    /// Parse already-resolved YAML text; paths resolve against the current directory
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let path = Path::new(CONFIG_FILE);
        let value = serde_yaml::from_str(content).map_err(|source| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_value(value, path)?;
        config.validate()?;
        Ok(config)
    }

    fn from_value(value: serde_yaml::Value, path: &Path) -> ConfigResult<Self> {
        // An empty document parses as null
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_yaml::from_value(value).map_err(|source| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source,
        })
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.sandbox.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sandbox.timeout_secs".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.sandbox.instruction_budget == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sandbox.instruction_budget".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.events.retain_per_source == 0 {
            return Err(ConfigError::InvalidValue {
                key: "events.retain_per_source".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.fingerprint.fallback_driver.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "fingerprint.fallback_driver".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_path(&self) -> PathBuf {
        self.resolve(&self.data_dir)
    }

    pub fn drivers_path(&self) -> PathBuf {
        self.resolve(&self.drivers_dir)
    }

    pub fn apps_path(&self) -> PathBuf {
        self.resolve(&self.apps_dir)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = HubConfig::load(dir.path()).unwrap();

        assert_eq!(config.data_dir, PathBuf::from(".hub"));
        assert_eq!(config.location.name, "Home");
        assert!(config.location.id.is_none());
        assert_eq!(config.sandbox.timeout(), Duration::from_secs(20));
        assert_eq!(config.sandbox.instruction_budget, 50_000_000);
        assert_eq!(config.events.retain_per_source, 100);
        assert_eq!(config.fingerprint.fallback_driver, "Unknown");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.drivers_path(), dir.path().join("drivers"));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
location:
  name: Cabin
  latitude: 46.5
sandbox:
  timeout_secs: 5
apps_dir: /opt/hub/apps
"#,
        )
        .unwrap();

        let config = HubConfig::load(dir.path()).unwrap();
        assert_eq!(config.location.name, "Cabin");
        assert_eq!(config.location.latitude, 46.5);
        assert_eq!(config.location.longitude, 0.0);
        assert_eq!(config.sandbox.timeout_secs, 5);
        assert_eq!(config.sandbox.instruction_budget, 50_000_000);
        assert_eq!(config.apps_path(), PathBuf::from("/opt/hub/apps"));
        assert_eq!(config.data_path(), dir.path().join(".hub"));
    }

    #[test]
    fn test_secret_location_id() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("secrets.yaml"), "home_id: loc-1\n").unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "location:\n  id: !secret home_id\n",
        )
        .unwrap();

        let config = HubConfig::load(dir.path()).unwrap();
        assert_eq!(config.location.id.as_deref(), Some("loc-1"));
    }

    #[test]
    fn test_empty_document() {
        let config = HubConfig::from_yaml_str("").unwrap();
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let result = HubConfig::from_yaml_str("events:\n  retain_per_source: 0\n");
        assert!(matches!(result, Err(ConfigError::InvalidValue { key, .. }) if key == "events.retain_per_source"));

        let result = HubConfig::from_yaml_str("sandbox:\n  timeout_secs: soon\n");
        assert!(matches!(result, Err(ConfigError::ParseYaml { .. })));
    }
}
