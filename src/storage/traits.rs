//! Abstract storage contract for cgmon.
//!
//! The engines never talk to a concrete database. Everything is stored as
//! opaque bytes under string keys through [`DataDb`]; typed access lives in
//! [`crate::storage::DataManager`].

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Key not present.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl StorageError {
    /// Returns true if the key was missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::BackendError(err.to_string())
    }
}

/// Key/value contract consumed by the data manager.
///
/// # Safety Considerations
/// - Implementations must be safe to call from many threads at once
/// - `set` replaces the full value; there are no partial updates
pub trait DataDb: Send + Sync {
    /// Get the raw value stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Remove `key`. Returns `KeyNotFound` if it was not present.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// List every key starting with `prefix`, in ascending order.
    fn keys_for_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}
