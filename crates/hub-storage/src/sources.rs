//! Raw source text of device handlers and smart apps

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use hub_core::DefinitionKind;
use tokio::fs;
use tracing::debug;

use crate::storage::StorageResult;

/// File extension of entity sources on disk
const SOURCE_EXTENSION: &str = "lua";

/// Source text retrieval port
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Ids of every source of a kind, sorted
    async fn list(&self, kind: DefinitionKind) -> StorageResult<Vec<String>>;

    /// Source text by id
    async fn source(&self, kind: DefinitionKind, id: &str) -> StorageResult<Option<String>>;
}

/// Sources read from `drivers/<id>.lua` and `apps/<id>.lua`
#[derive(Debug, Clone)]
pub struct DirSourceStore {
    drivers_dir: PathBuf,
    apps_dir: PathBuf,
}

impl DirSourceStore {
    pub fn new(drivers_dir: impl AsRef<Path>, apps_dir: impl AsRef<Path>) -> Self {
        Self {
            drivers_dir: drivers_dir.as_ref().to_path_buf(),
            apps_dir: apps_dir.as_ref().to_path_buf(),
        }
    }

    fn dir(&self, kind: DefinitionKind) -> &Path {
        match kind {
            DefinitionKind::DeviceHandler => &self.drivers_dir,
            DefinitionKind::SmartApp => &self.apps_dir,
        }
    }
}

#[async_trait]
impl SourceStore for DirSourceStore {
    async fn list(&self, kind: DefinitionKind) -> StorageResult<Vec<String>> {
        let dir = self.dir(kind);
        if !fs::try_exists(dir).await.unwrap_or(false) {
            debug!(?dir, "Source directory does not exist");
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SOURCE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn source(&self, kind: DefinitionKind, id: &str) -> StorageResult<Option<String>> {
        let path = self.dir(kind).join(format!("{}.{}", id, SOURCE_EXTENSION));
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Sources held in memory
#[derive(Debug, Default)]
pub struct MemorySourceStore {
    sources: DashMap<(DefinitionKind, String), String>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a source
    pub fn insert(&self, kind: DefinitionKind, id: impl Into<String>, text: impl Into<String>) {
        self.sources.insert((kind, id.into()), text.into());
    }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn list(&self, kind: DefinitionKind) -> StorageResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .sources
            .iter()
            .filter(|r| r.key().0 == kind)
            .map(|r| r.key().1.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn source(&self, kind: DefinitionKind, id: &str) -> StorageResult<Option<String>> {
        Ok(self
            .sources
            .get(&(kind, id.to_string()))
            .map(|r| r.value().clone()))
    }
}
