//! YAML loader with custom tag support
//!
//! Tags are resolved while walking the parsed document, so a tagged value
//! may appear anywhere: as a mapping value, inside a sequence or as a key.

use crate::error::{ConfigError, ConfigResult};
use crate::secrets::Secrets;
use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// YAML loader resolving `!include`, `!secret` and `!env_var`
pub struct YamlLoader {
    /// Base directory for relative paths and secrets.yaml
    config_dir: PathBuf,
    secrets: Secrets,
    /// Files currently being loaded, for cycle detection
    loading: HashSet<PathBuf>,
}

impl YamlLoader {
    /// Create a loader for the given config directory, reading its secrets.yaml
    pub fn new(config_dir: impl Into<PathBuf>) -> ConfigResult<Self> {
        let config_dir = config_dir.into();
        let secrets = Secrets::load(&config_dir)?;
        Ok(Self::with_secrets(config_dir, secrets))
    }

    /// Create a loader with pre-loaded secrets
    pub fn with_secrets(config_dir: impl Into<PathBuf>, secrets: Secrets) -> Self {
        Self {
            config_dir: config_dir.into(),
            secrets,
            loading: HashSet::new(),
        }
    }

    /// Load and resolve a YAML file
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.resolve_path(path.as_ref());
        debug!(path = %path.display(), "Loading YAML file");

        if !self.loading.insert(path.clone()) {
            return Err(ConfigError::CircularInclude { path });
        }

        let result = fs::read_to_string(&path)
            .map_err(|source| ConfigError::ReadFile {
                path: path.clone(),
                source,
            })
            .and_then(|content| self.load_string(&content, &path));
        self.loading.remove(&path);
        result
    }

    /// Load and resolve YAML text; `source_path` anchors relative includes
    pub fn load_string(&mut self, content: &str, source_path: &Path) -> ConfigResult<Value> {
        let value: Value =
            serde_yaml::from_str(content).map_err(|source| ConfigError::ParseYaml {
                path: source_path.to_path_buf(),
                source,
            })?;
        self.resolve(value, source_path)
    }

    fn resolve(&mut self, value: Value, source_path: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.resolve_tag(*tagged, source_path),
            Value::Mapping(map) => {
                let mut resolved = Mapping::with_capacity(map.len());
                for (key, value) in map {
                    let key = self.resolve(key, source_path)?;
                    let value = self.resolve(value, source_path)?;
                    resolved.insert(key, value);
                }
                Ok(Value::Mapping(resolved))
            }
            Value::Sequence(items) => items
                .into_iter()
                .map(|item| self.resolve(item, source_path))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            other => Ok(other),
        }
    }

    fn resolve_tag(&mut self, tagged: TaggedValue, source_path: &Path) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!(tag = %tag, "Resolving tag");

        match tag.as_str() {
            "!include" => {
                let path = self.include_path(&tagged.value, source_path)?;
                self.load_file(path)
            }
            "!secret" => {
                let key = tag_argument(&tagged.value, "!secret", "secret key")?;
                let secret = self.secrets.get(key)?;
                debug!(key, "Substituted secret");
                Ok(Value::String(secret.to_string()))
            }
            "!env_var" => {
                let var = tag_argument(&tagged.value, "!env_var", "environment variable name")?;
                let value = std::env::var(var).map_err(|_| ConfigError::EnvVarNotFound {
                    var: var.to_string(),
                })?;
                debug!(var, "Substituted env var");
                Ok(Value::String(value))
            }
            _ => {
                // Unknown tag: keep it, but resolve what it wraps
                let value = self.resolve(tagged.value, source_path)?;
                Ok(Value::Tagged(Box::new(TaggedValue {
                    tag: tagged.tag,
                    value,
                })))
            }
        }
    }

    /// Include paths are relative to the including file
    fn include_path(&self, value: &Value, source_path: &Path) -> ConfigResult<PathBuf> {
        let Value::String(raw) = value else {
            return Err(ConfigError::InvalidIncludePath {
                path: format!("{:?}", value),
                reason: "path must be a string".to_string(),
            });
        };
        let raw = Path::new(raw);
        if raw.is_absolute() {
            return Ok(raw.to_path_buf());
        }
        let base = source_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(&self.config_dir);
        Ok(base.join(raw))
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir.join(path)
        }
    }

    /// Get a reference to the secrets store
    pub fn secrets(&self) -> &Secrets {
        &self.secrets
    }

    /// Get the config directory
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

fn tag_argument<'a>(value: &'a Value, tag: &str, what: &str) -> ConfigResult<&'a str> {
    value.as_str().ok_or_else(|| ConfigError::InvalidValue {
        key: tag.to_string(),
        reason: format!("{} must be a string", what),
    })
}

/// Load a YAML file with full tag processing
pub fn load_yaml(config_dir: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    YamlLoader::new(config_dir)?.load_file(file)
}

/// Load a YAML string with tag processing
pub fn load_yaml_string(
    config_dir: impl Into<PathBuf>,
    content: &str,
    source_name: &str,
) -> ConfigResult<Value> {
    YamlLoader::new(config_dir)?.load_string(content, Path::new(source_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn get<'a>(value: &'a Value, key: &str) -> &'a Value {
        value.as_mapping().unwrap().get(key).unwrap()
    }

    #[test]
    fn test_include_is_relative_to_including_file() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "parts/location.yaml", "name: Cabin\nlatitude: 46.5\n");
        write_file(dir.path(), "parts/hub.yaml", "location: !include location.yaml\n");
        write_file(dir.path(), "hub.yaml", "nested: !include parts/hub.yaml\n");

        let value = load_yaml(dir.path(), "hub.yaml").unwrap();
        let location = get(get(&value, "nested"), "location");
        assert_eq!(get(location, "name"), &Value::String("Cabin".into()));
    }

    #[test]
    fn test_secret() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "secrets.yaml", "location_id: loc-42\n");
        write_file(dir.path(), "hub.yaml", "id: !secret location_id\n");

        let value = load_yaml(dir.path(), "hub.yaml").unwrap();
        assert_eq!(get(&value, "id"), &Value::String("loc-42".into()));
    }

    #[test]
    fn test_missing_secret() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "secrets.yaml", "existing: value\n");
        write_file(dir.path(), "hub.yaml", "id: !secret nonexistent\n");

        let result = load_yaml(dir.path(), "hub.yaml");
        assert!(matches!(result, Err(ConfigError::SecretNotFound { .. })));
    }

    #[test]
    fn test_env_var() {
        let dir = TempDir::new().unwrap();
        std::env::set_var("TEST_HUB_CONFIG_DATA_DIR", "/var/lib/hub");
        write_file(
            dir.path(),
            "hub.yaml",
            "data_dir: !env_var TEST_HUB_CONFIG_DATA_DIR\n",
        );

        let value = load_yaml(dir.path(), "hub.yaml").unwrap();
        assert_eq!(get(&value, "data_dir"), &Value::String("/var/lib/hub".into()));
        std::env::remove_var("TEST_HUB_CONFIG_DATA_DIR");
    }

    #[test]
    fn test_missing_env_var() {
        let dir = TempDir::new().unwrap();
        let result = load_yaml_string(
            dir.path(),
            "x: !env_var TEST_HUB_CONFIG_SURELY_UNSET\n",
            "inline.yaml",
        );
        assert!(matches!(result, Err(ConfigError::EnvVarNotFound { .. })));
    }

    #[test]
    fn test_circular_include_detection() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "a.yaml", "b: !include b.yaml\n");
        write_file(dir.path(), "b.yaml", "a: !include a.yaml\n");

        let result = load_yaml(dir.path(), "a.yaml");
        assert!(matches!(result, Err(ConfigError::CircularInclude { .. })));
    }

    #[test]
    fn test_unknown_tag_is_kept() {
        let dir = TempDir::new().unwrap();
        let value = load_yaml_string(dir.path(), "x: !custom 5\n", "inline.yaml").unwrap();
        assert!(matches!(get(&value, "x"), Value::Tagged(_)));
    }
}
