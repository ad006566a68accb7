//! Error types for the context engine

use thiserror::Error;

/// Result type alias for context engine operations
pub type Result<T> = std::result::Result<T, ContextError>;

/// Context engine errors
///
/// Capacity exhaustion during normal operation is signaled by return value
/// (`allocate` returning `false`, allocator decisions with `success: false`),
/// not through this type. `BudgetExhausted` is reserved for the degenerate
/// case where content cannot fit even after compaction and eviction.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Configuration invalid: {0}")]
    Configuration(String),

    #[error("Budget exhausted: need {needed} tokens, {available} available after compaction")]
    BudgetExhausted { needed: usize, available: usize },

    #[error("Unsupported session version {found} (supported: <= {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Checkpoints not supported by this storage backend")]
    CheckpointsUnsupported,

    #[error("Summarization failed: {0}")]
    Summarization(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}
