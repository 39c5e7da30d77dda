//! Storage error handling
//!
//! Provides typed errors for storage operations. Every fallible
//! operation in the crate returns [`StoreResult`], and callers can
//! match on the kind to decide whether to retry, re-initialize, or
//! give up.

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Operation attempted before `initialize()` or after `close()`
    #[error("Store is not ready: {0}. Call initialize() before use; a closed store cannot be reused.")]
    NotReady(&'static str),

    /// Input the caller handed us is structurally invalid
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// DDL failure while creating or validating schema objects
    #[error("Schema error in '{table}': {details}")]
    Schema { table: String, details: String },

    /// Underlying statement execution or connection failure
    #[error("Database error: {0}")]
    Io(String),

    /// Encryption or decryption callback failed or produced invalid output
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Could not produce a healthy connection within the acquire timeout
    #[error("Connection acquire timed out after {waited_ms}ms ({failures} failed attempts)")]
    AcquireTimeout { waited_ms: u64, failures: u64 },

    /// Pool has been closed and no longer lends connections
    #[error("Connection pool is closed")]
    PoolClosed,
}

impl StorageError {
    /// Wrap a vendor database error message as an io-error
    pub fn io(msg: impl Into<String>) -> Self {
        StorageError::Io(msg.into())
    }

    /// Build a malformed-input error
    pub fn malformed(msg: impl Into<String>) -> Self {
        StorageError::MalformedInput(msg.into())
    }

    /// Build a schema error for a specific table
    pub fn schema(table: impl Into<String>, details: impl Into<String>) -> Self {
        StorageError::Schema {
            table: table.into(),
            details: details.into(),
        }
    }

    /// Whether this error indicates the store can be used again after
    /// re-initialization (as opposed to bad caller input)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StorageError::Io(_)
                | StorageError::AcquireTimeout { .. }
                | StorageError::NotReady(_)
        )
    }
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StorageError>;
