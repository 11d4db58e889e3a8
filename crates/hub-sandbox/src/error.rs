//! Sandbox errors

use thiserror::Error;

/// Errors raised while running entity code
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Source has no `definition` declaration
    #[error("No definition declared in {source_id}")]
    DefinitionNotFound { source_id: String },

    /// Source failed to compile
    #[error("Compile error in {source_id}: {message}")]
    Compile { source_id: String, message: String },

    /// Code raised an error or misused a primitive
    #[error("Script error in {source_id}: {message}")]
    ScriptRuntime {
        source_id: String,
        message: String,
        /// Stack frames from the entity's own source, innermost first
        traceback: Vec<String>,
    },

    /// Wall-clock limit exceeded
    #[error("Script {source_id} timed out after {seconds}s")]
    Timeout { source_id: String, seconds: u64 },

    /// Instruction budget exhausted
    #[error("Script {source_id} exceeded its instruction budget of {budget}")]
    InstructionBudget { source_id: String, budget: u64 },

    /// VM setup or value conversion failed
    #[error("Sandbox setup failed: {0}")]
    Setup(String),

    /// Execution thread panicked or was cancelled
    #[error("Sandbox task failed: {0}")]
    Join(String),
}

impl SandboxError {
    /// Whether the error was raised by the entity's own code (as opposed to the host)
    pub fn is_script_error(&self) -> bool {
        matches!(
            self,
            SandboxError::Compile { .. }
                | SandboxError::ScriptRuntime { .. }
                | SandboxError::Timeout { .. }
                | SandboxError::InstructionBudget { .. }
        )
    }
}

impl From<mlua::Error> for SandboxError {
    fn from(err: mlua::Error) -> Self {
        SandboxError::Setup(err.to_string())
    }
}

/// Result type for sandbox operations
pub type SandboxResult<T> = Result<T, SandboxError>;
