//! Error types shared by the storage and pipeline layers.

use thiserror::Error;

/// Errors raised while reading or writing persisted cells.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Record header is not a cell record
    #[error("Invalid cell record: {0}")]
    InvalidFormat(String),

    /// Schema version mismatch
    #[error("Schema version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Expected version
        expected: String,
        /// Actual version found
        actual: String,
    },
}

/// Errors raised while parsing a namespaced identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    /// Empty namespace or path
    #[error("empty component in identifier {0:?}")]
    Empty(String),

    /// Character outside `[a-z0-9_.-/]`
    #[error("invalid character {ch:?} in identifier {input:?}")]
    InvalidChar {
        /// The offending input
        input: String,
        /// First invalid character
        ch: char,
    },
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
