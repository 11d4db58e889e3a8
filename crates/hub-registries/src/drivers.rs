//! Driver (device handler and smart app) definition registry

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use hub_core::{names, Command, DefinitionKind, DriverDefinition};
use hub_storage::Repository;
use indexmap::IndexMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::capabilities::{AttributeSpec, CapabilityCatalog, CapabilityProjection};
use crate::error::{RegistryError, RegistryResult};
use crate::fingerprint::{best_match, FingerprintMatch, IndexedFingerprint};

/// What [`DriverRegistry::upsert`] did with a definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Registry of definitions in registration order
pub struct DriverRegistry {
    repository: Arc<dyn Repository<DriverDefinition>>,
    catalog: Arc<CapabilityCatalog>,
    loaded: OnceCell<()>,
    definitions: RwLock<IndexMap<String, Arc<DriverDefinition>>>,
    /// Rebuilt on first resolve after any definition change
    fingerprint_index: RwLock<Option<Arc<Vec<IndexedFingerprint>>>>,
    projections: DashMap<String, Arc<CapabilityProjection>>,
}

impl DriverRegistry {
    pub fn new(
        repository: Arc<dyn Repository<DriverDefinition>>,
        catalog: Arc<CapabilityCatalog>,
    ) -> Self {
        Self {
            repository,
            catalog,
            loaded: OnceCell::new(),
            definitions: RwLock::new(IndexMap::new()),
            fingerprint_index: RwLock::new(None),
            projections: DashMap::new(),
        }
    }

    /// Populate the cache from the repository once
    async fn ensure_loaded(&self) -> RegistryResult<()> {
        self.loaded
            .get_or_try_init(|| async {
                let records = self.repository.list().await?;
                let count = records.len();
                let mut definitions = self.write_definitions();
                for record in records {
                    definitions
                        .entry(record.id.clone())
                        .or_insert_with(|| Arc::new(record));
                }
                drop(definitions);
                info!(count, "Loaded driver definitions");
                Ok::<(), RegistryError>(())
            })
            .await?;
        Ok(())
    }

    fn read_definitions(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, IndexMap<String, Arc<DriverDefinition>>> {
        self.definitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_definitions(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, IndexMap<String, Arc<DriverDefinition>>> {
        self.definitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn invalidate(&self, id: &str) {
        *self
            .fingerprint_index
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        self.projections.remove(id);
    }

    pub async fn get(&self, id: &str) -> RegistryResult<Option<Arc<DriverDefinition>>> {
        self.ensure_loaded().await?;
        Ok(self.read_definitions().get(id).cloned())
    }

    /// Like [`get`](Self::get) but a missing definition is an error
    pub async fn require(&self, id: &str) -> RegistryResult<Arc<DriverDefinition>> {
        self.get(id).await?.ok_or_else(|| RegistryError::NotFound {
            kind: "definition",
            id: id.to_string(),
        })
    }

    pub async fn list(&self) -> RegistryResult<Vec<Arc<DriverDefinition>>> {
        self.ensure_loaded().await?;
        Ok(self.read_definitions().values().cloned().collect())
    }

    pub async fn list_kind(&self, kind: DefinitionKind) -> RegistryResult<Vec<Arc<DriverDefinition>>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|d| d.kind == kind)
            .collect())
    }

    /// Register a freshly extracted definition
    ///
    /// An existing definition from the same source, or with the same
    /// namespace and name, keeps its id. Equivalent content is a no-op.
    pub async fn upsert(
        &self,
        mut draft: DriverDefinition,
    ) -> RegistryResult<(Arc<DriverDefinition>, UpsertOutcome)> {
        self.ensure_loaded().await?;

        let existing = {
            let definitions = self.read_definitions();
            let by_id = definitions.get(&draft.id).cloned();
            by_id.or_else(|| {
                definitions
                    .values()
                    .find(|d| {
                        d.kind == draft.kind
                            && (d.source_id == draft.source_id || d.type_key() == draft.type_key())
                    })
                    .cloned()
            })
        };

        match existing {
            Some(current) if current.equivalent(&draft) => {
                debug!(id = %current.id, name = %current.name, "Definition unchanged");
                Ok((current, UpsertOutcome::Unchanged))
            }
            Some(current) => {
                draft.id = current.id.clone();
                let updated = self.repository.update(draft).await?;
                let updated = Arc::new(updated);
                self.write_definitions()
                    .insert(updated.id.clone(), updated.clone());
                self.invalidate(&updated.id);
                info!(id = %updated.id, name = %updated.name, "Definition updated");
                Ok((updated, UpsertOutcome::Updated))
            }
            None => {
                if draft.id.is_empty() {
                    draft.id = hub_core::new_id();
                }
                let created = Arc::new(self.repository.create(draft).await?);
                self.write_definitions()
                    .insert(created.id.clone(), created.clone());
                self.invalidate(&created.id);
                info!(id = %created.id, name = %created.name, kind = %created.kind, "Definition registered");
                Ok((created, UpsertOutcome::Created))
            }
        }
    }

    /// Look a definition up by namespace and name (case-insensitive)
    pub async fn find_by_type(
        &self,
        kind: DefinitionKind,
        namespace: &str,
        name: &str,
    ) -> RegistryResult<Option<Arc<DriverDefinition>>> {
        let key = (namespace.to_lowercase(), name.to_lowercase());
        Ok(self
            .list_kind(kind)
            .await?
            .into_iter()
            .find(|d| d.type_key() == key))
    }

    /// First definition of `kind` with the given name (case-insensitive)
    pub async fn find_by_name(
        &self,
        kind: DefinitionKind,
        name: &str,
    ) -> RegistryResult<Option<Arc<DriverDefinition>>> {
        Ok(self
            .list_kind(kind)
            .await?
            .into_iter()
            .find(|d| d.name.eq_ignore_ascii_case(name)))
    }

    async fn fingerprint_index(&self) -> RegistryResult<Arc<Vec<IndexedFingerprint>>> {
        self.ensure_loaded().await?;
        if let Some(index) = self
            .fingerprint_index
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            return Ok(index.clone());
        }

        let index: Vec<IndexedFingerprint> = self
            .read_definitions()
            .values()
            .filter(|d| d.kind == DefinitionKind::DeviceHandler)
            .flat_map(|d| {
                d.fingerprints
                    .iter()
                    .map(|fp| IndexedFingerprint::new(&d.id, &d.name, fp))
            })
            .collect();
        debug!(fingerprints = index.len(), "Built fingerprint index");

        let index = Arc::new(index);
        *self
            .fingerprint_index
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(index.clone());
        Ok(index)
    }

    /// Pick the device handler best matching announced device attributes
    ///
    /// Falls back to the device handler named `fallback_name` when nothing
    /// scores above the acceptance threshold.
    pub async fn resolve_fingerprint(
        &self,
        device_info: &HashMap<String, String>,
        fallback_name: &str,
    ) -> RegistryResult<Option<FingerprintMatch>> {
        let index = self.fingerprint_index().await?;
        if let Some((winner, score)) = best_match(&index, device_info) {
            debug!(definition = %winner.definition_name, score, "Fingerprint matched");
            return Ok(Some(FingerprintMatch {
                definition_id: winner.definition_id.clone(),
                join_name: winner.join_name(),
                score: Some(score),
            }));
        }

        let fallback = self
            .find_by_name(DefinitionKind::DeviceHandler, fallback_name)
            .await?;
        Ok(fallback.map(|d| FingerprintMatch {
            definition_id: d.id.clone(),
            join_name: names::UNKNOWN_DEVICE_JOIN_NAME.to_string(),
            score: None,
        }))
    }

    /// Attribute and command surface of a definition, memoized
    pub async fn projection(&self, id: &str) -> RegistryResult<Arc<CapabilityProjection>> {
        if let Some(projection) = self.projections.get(id) {
            return Ok(projection.clone());
        }
        let definition = self.require(id).await?;
        let projection = Arc::new(self.catalog.project(&definition));
        self.projections.insert(id.to_string(), projection.clone());
        Ok(projection)
    }

    pub async fn attributes(&self, id: &str) -> RegistryResult<Vec<AttributeSpec>> {
        Ok(self.projection(id).await?.attributes.clone())
    }

    pub async fn commands(&self, id: &str) -> RegistryResult<Vec<Command>> {
        Ok(self.projection(id).await?.commands.clone())
    }

    pub async fn flush(&self) -> RegistryResult<()> {
        self.repository.flush().await?;
        Ok(())
    }

    pub fn catalog(&self) -> &CapabilityCatalog {
        &self.catalog
    }

    /// Remove a definition; dependents must be checked by the caller
    pub async fn delete(&self, id: &str) -> RegistryResult<bool> {
        self.ensure_loaded().await?;
        let removed = self.repository.delete(id).await?;
        self.write_definitions().shift_remove(id);
        self.invalidate(id);
        if removed {
            info!(id, "Definition deleted");
        }
        Ok(removed)
    }
}
