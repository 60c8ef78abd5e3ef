//! Error types for context management

use thiserror::Error;

/// Context management error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("token estimation is not implemented for model `{0}`")]
    UnsupportedModel(String),

    #[error("cannot fit conversation into {limit} tokens without evicting pinned turns ({tokens} tokens remain)")]
    EvictionExhausted { tokens: usize, limit: usize },

    #[error("turn index {index} out of range for conversation of {len} turns")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("eviction index must be greater than zero")]
    InvalidEvictionIndex,

    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

/// Result type for context operations
pub type ContextResult<T> = Result<T, ContextError>;
