//! Registry errors

use hub_storage::StorageError;
use thiserror::Error;

/// Errors raised by the registries
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} is in use by {dependents:?}")]
    EntityInUse {
        kind: &'static str,
        id: String,
        dependents: Vec<String>,
    },

    #[error("Device network id already registered: {key}")]
    DuplicateNetworkId { key: String },

    #[error("Invalid capability catalog: {0}")]
    Catalog(String),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;
