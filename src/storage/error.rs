//! Storage layer error types.

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error while converting {description}: {source}")]
    Conversion {
        description: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not serialize {object}: {reason}")]
    Serialization { object: String, reason: String },

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("LOB {lob_id} failed its integrity check")]
    IntegrityCheckFailed { lob_id: i64 },

    #[error("LOB not found: {0}")]
    LobNotFound(i64),

    #[error("LOB store is read-only")]
    ReadOnly,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Wrap an I/O failure together with a description of the value involved.
    pub fn conversion(source: std::io::Error, description: impl ToString) -> Self {
        StorageError::Conversion {
            description: description.to_string(),
            source,
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
