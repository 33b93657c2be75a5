//! Durable storage backend.
//!
//! - Write-ahead log for crash recovery
//! - File lock for single-process access
//! - CRC32 checksums on every frame
//! - Snapshot compaction once the WAL grows past a threshold
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                    FileDb                     │
//! ├──────────────────────────────────────────────┤
//! │  in-memory BTreeMap  ←── replay ──┐           │
//! │          │                        │           │
//! │          ↓ compact                │           │
//! │  ┌─────────────────┐  ┌──────────────────┐    │
//! │  │ cgmon.snapshot  │  │ cgmon.wal        │    │
//! │  └─────────────────┘  └──────────────────┘    │
//! │               FileLock (.lock)                │
//! └──────────────────────────────────────────────┘
//! ```

mod file_lock;
mod store;
mod wal;

pub use file_lock::FileLock;
pub use store::{CompactionResult, FileDb};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use crate::storage::StorageError;

/// Configuration for the durable backend.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// WAL size that triggers compaction (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every write.
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024,
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// # Errors
    ///
    /// `BackendError` if `max_wal_size` is below 4 KiB.
    pub fn validate(self) -> Result<Self, StorageError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(StorageError::BackendError(format!(
                "max_wal_size must be at least {} bytes (got {})",
                Self::MIN_WAL_SIZE,
                self.max_wal_size
            )));
        }
        Ok(self)
    }
}

/// Open or create a durable store at `path`.
///
/// # Errors
///
/// Invalid config, a locked directory, or corrupt files.
///
/// # Example
/// ```rust,ignore
/// use cgmon::storage::persistent::open_database;
///
/// let db = open_database("./data", None)?;
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<FileDb, StorageError> {
    let cfg = config.unwrap_or_default().validate()?;
    FileDb::open(path.as_ref(), cfg)
}
