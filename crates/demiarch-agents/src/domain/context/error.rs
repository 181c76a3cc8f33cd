use thiserror::Error;

/// Errors raised while storing or retrieving context
#[derive(Debug, Error)]
pub enum ContextError {
    /// Invalid input provided to the context subsystem
    #[error("Invalid context input: {0}")]
    InvalidInput(String),

    /// Errors produced while generating embeddings
    #[error("Embedding failed: {0}")]
    Embedding(String),

    /// Errors persisting or loading context items
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type for context operations
pub type ContextResult<T> = Result<T, ContextError>;

impl ContextError {
    pub fn invalid<T: Into<String>>(msg: T) -> Self {
        ContextError::InvalidInput(msg.into())
    }

    pub fn storage<T: Into<String>>(msg: T) -> Self {
        ContextError::Storage(msg.into())
    }
}
