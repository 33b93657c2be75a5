//! File-backed [`DataDb`].
//!
//! Reads are served from an in-memory map. Writes go to the WAL first and are
//! applied to the map only once the append succeeded. Compaction writes the
//! whole map to a snapshot file (temp file + rename) and then truncates the
//! WAL; a crash between the two just replays already-snapshotted entries,
//! which is harmless because every entry carries the full value.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::storage::codec;
use crate::storage::traits::{DataDb, StorageError};

use super::file_lock::FileLock;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "cgmon.wal";
const SNAPSHOT_FILE: &str = "cgmon.snapshot";
const SNAPSHOT_TMP_FILE: &str = "cgmon.snapshot.tmp";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    items: BTreeMap<String, Vec<u8>>,
}

/// Outcome of a compaction.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// Keys written to the snapshot.
    pub keys_written: usize,
    /// WAL size before compaction.
    pub wal_size_before: u64,
    /// WAL size after compaction.
    pub wal_size_after: u64,
}

/// Durable single-process key/value store.
pub struct FileDb {
    dir: PathBuf,
    _lock: FileLock,
    wal: WriteAheadLog,
    items: RwLock<BTreeMap<String, Vec<u8>>>,
    config: PersistentConfig,
}

impl FileDb {
    /// Open or create a store in `dir`.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created, is locked by another process,
    /// or holds a corrupt snapshot or WAL entry.
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| {
            StorageError::ConnectionError(format!("failed to create data directory: {e}"))
        })?;
        let lock = FileLock::acquire(dir)
            .map_err(|e| StorageError::ConnectionError(format!("failed to acquire lock: {e}")))?;

        let items = load_snapshot(&dir.join(SNAPSHOT_FILE))?;
        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| StorageError::ConnectionError(format!("failed to open WAL: {e}")))?;

        let db = Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            items: RwLock::new(items),
            config,
        };
        db.replay_wal()?;
        Ok(db)
    }

    fn replay_wal(&self) -> Result<(), StorageError> {
        let mut items = self.items.write().map_err(|_| lock_err("filedb.replay"))?;
        let mut count = 0usize;
        for entry in self.wal.iter()? {
            let entry = entry.map_err(|e| StorageError::BackendError(format!("corrupted WAL entry: {e}")))?;
            match entry.kind {
                WalEntryKind::Set { key, value } => {
                    items.insert(key, value);
                }
                WalEntryKind::Remove { key } => {
                    items.remove(&key);
                }
            }
            count += 1;
        }
        if count > 0 {
            tracing::info!(entries = count, dir = %self.dir.display(), "replayed WAL");
        }
        Ok(())
    }

    /// Directory this store lives in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current WAL size in bytes.
    #[must_use]
    pub fn wal_size(&self) -> u64 {
        self.wal.size_bytes().unwrap_or(0)
    }

    /// Write a snapshot of every key and truncate the WAL.
    ///
    /// # Errors
    ///
    /// Fails if the snapshot cannot be written. The WAL is left untouched in
    /// that case, so nothing is lost.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let items = self.items.write().map_err(|_| lock_err("filedb.compact"))?;
        self.compact_locked(&items)
    }

    fn compact_locked(
        &self,
        items: &RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>>,
    ) -> Result<CompactionResult, StorageError> {
        let wal_size_before = self.wal.size_bytes()?;
        let snapshot = Snapshot {
            items: (**items).clone(),
        };

        let tmp = self.dir.join(SNAPSHOT_TMP_FILE);
        if let Err(e) = write_snapshot(&tmp, &snapshot, self.config.sync_on_write) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE))?;
        self.wal.truncate()?;

        let result = CompactionResult {
            keys_written: snapshot.items.len(),
            wal_size_before,
            wal_size_after: self.wal.size_bytes()?,
        };
        tracing::debug!(keys = result.keys_written, before = wal_size_before, "compacted WAL");
        Ok(result)
    }

    fn apply(&self, kind: WalEntryKind) -> Result<(), StorageError> {
        let mut items = self.items.write().map_err(|_| lock_err("filedb.write"))?;
        if let WalEntryKind::Remove { key } = &kind {
            if !items.contains_key(key) {
                return Err(StorageError::KeyNotFound(key.clone()));
            }
        }
        self.wal.append(kind.clone())?;
        match kind {
            WalEntryKind::Set { key, value } => {
                items.insert(key, value);
            }
            WalEntryKind::Remove { key } => {
                items.remove(&key);
            }
        }

        if self.wal.size_bytes()? > self.config.max_wal_size {
            self.compact_locked(&items)?;
        }
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Result<BTreeMap<String, Vec<u8>>, StorageError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let mut reader = BufReader::new(File::open(path)?);
    codec::read_header(&mut reader)?;
    let snapshot: Snapshot = codec::decode(&mut reader)
        .map_err(|e| StorageError::BackendError(format!("corrupted snapshot: {e}")))?;
    Ok(snapshot.items)
}

fn write_snapshot(path: &Path, snapshot: &Snapshot, sync: bool) -> Result<(), StorageError> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    let mut writer = BufWriter::new(file);
    codec::write_header(&mut writer)?;
    writer.write_all(&codec::encode(snapshot)?)?;
    writer.flush()?;
    if sync {
        writer.get_ref().sync_all()?;
    }
    Ok(())
}

impl DataDb for FileDb {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let items = self.items.read().map_err(|_| lock_err("filedb.get"))?;
        Ok(items.get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.apply(WalEntryKind::Set {
            key: key.to_string(),
            value,
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.apply(WalEntryKind::Remove { key: key.to_string() })
    }

    fn keys_for_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let items = self.items.read().map_err(|_| lock_err("filedb.keys"))?;
        Ok(items
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
