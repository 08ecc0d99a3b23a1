//! Error types for memvault

use thiserror::Error;

/// Result type alias for memvault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// Main error type for memvault
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[cfg(feature = "postgres")]
    #[error("Postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A bulk update/delete arrived with no filter and without `force`
    #[error("Refusing unfiltered {0}: pass at least one filter or set force=true")]
    UnfilteredOperation(&'static str),

    #[error("Storage is not ready (waited {waited_ms} ms)")]
    NotReady { waited_ms: u64 },

    #[error("Operation '{operation}' is not implemented for the {backend} backend")]
    NotImplemented {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("Operation '{operation}' timed out after {after_ms} ms")]
    Timeout { operation: &'static str, after_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(feature = "openai")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VaultError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        VaultError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        #[cfg(feature = "openai")]
        if matches!(self, VaultError::Http(_)) {
            return true;
        }
        matches!(
            self,
            VaultError::NotReady { .. } | VaultError::Timeout { .. }
        )
    }

    /// Get error code for the protocol layer
    pub fn code(&self) -> i64 {
        match self {
            VaultError::NotFound { .. } => -32001,
            VaultError::InvalidInput(_) | VaultError::UnfilteredOperation(_) => -32602,
            VaultError::NotReady { .. } => -32002,
            VaultError::Timeout { .. } => -32004,
            VaultError::NotImplemented { .. } => -32601,
            _ => -32000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(VaultError::NotReady { waited_ms: 5000 }.is_retryable());
        assert!(VaultError::Timeout {
            operation: "search_memories",
            after_ms: 10
        }
        .is_retryable());
        assert!(!VaultError::InvalidInput("bad".into()).is_retryable());
        assert!(!VaultError::UnfilteredOperation("delete_memories").is_retryable());
    }

    #[test]
    fn test_not_implemented_is_distinguishable() {
        let err = VaultError::NotImplemented {
            backend: "postgres",
            operation: "semantic_search_docs",
        };
        assert_eq!(err.code(), -32601);
        assert!(err.to_string().contains("semantic_search_docs"));
        assert!(err.to_string().contains("postgres"));
    }
}
