//! In-memory storage backend.
//!
//! Thread-safe [`DataDb`] over an ordered map. Used for embedded runs and
//! tests, and as the reference behaviour for the durable backend.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::storage::traits::{DataDb, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// In-memory key/value store.
#[derive(Debug, Default)]
pub struct InMemoryDb {
    items: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryDb {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    ///
    /// # Errors
    ///
    /// `BackendError` if the lock is poisoned.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.items.read().map_err(|_| lock_err("memory.len"))?.len())
    }

    /// Returns true if nothing is stored.
    ///
    /// # Errors
    ///
    /// `BackendError` if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

impl DataDb for InMemoryDb {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let items = self.items.read().map_err(|_| lock_err("memory.get"))?;
        Ok(items.get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut items = self.items.write().map_err(|_| lock_err("memory.set"))?;
        items.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut items = self.items.write().map_err(|_| lock_err("memory.remove"))?;
        items
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::KeyNotFound(key.to_string()))
    }

    fn keys_for_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let items = self.items.read().map_err(|_| lock_err("memory.keys"))?;
        Ok(items
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let db = InMemoryDb::new();
        db.set("stq_t:1", b"a".to_vec()).unwrap();
        assert_eq!(db.get("stq_t:1").unwrap(), Some(b"a".to_vec()));

        db.remove("stq_t:1").unwrap();
        assert_eq!(db.get("stq_t:1").unwrap(), None);
        assert!(db.remove("stq_t:1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_keys_for_prefix_is_bounded() {
        let db = InMemoryDb::new();
        for key in ["sqp_t:1", "sqp_t:2", "sqp_u:1", "stq_t:1"] {
            db.set(key, Vec::new()).unwrap();
        }
        assert_eq!(db.keys_for_prefix("sqp_t:").unwrap(), vec!["sqp_t:1", "sqp_t:2"]);
        assert_eq!(db.keys_for_prefix("sqp_").unwrap().len(), 3);
        assert!(db.keys_for_prefix("thp_").unwrap().is_empty());
        assert_eq!(db.len().unwrap(), 4);
    }
}
