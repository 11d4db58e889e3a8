//! Runtime errors

use hub_core::DefinitionKind;
use hub_registries::RegistryError;
use hub_sandbox::SandboxError;
use hub_scheduler::SchedulerError;
use hub_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("No source for {kind} {source_id}")]
    SourceNotFound {
        kind: DefinitionKind,
        source_id: String,
    },

    #[error("Unknown device type: {namespace}/{type_name}")]
    UnknownDeviceType { namespace: String, type_name: String },

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Integration error: {0}")]
    Integration(String),

    #[error("Runtime is shutting down")]
    ShuttingDown,
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
