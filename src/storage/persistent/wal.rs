//! Write-ahead log for the file-backed store.
//!
//! Every `set` and `remove` is appended here before it is applied to the
//! in-memory map. On open the log is replayed on top of the last snapshot.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-encoded WalEntry]
//! [ENTRY 2: codec-encoded WalEntry]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The mutation being logged.
    pub kind: WalEntryKind,
}

/// The mutation recorded by a WAL entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    Set { key: String, value: Vec<u8> },
    Remove { key: String },
}

struct WalState {
    writer: BufWriter<File>,
    sequence: u64,
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "poisoned lock: wal")
}

/// Append-only log. Thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    state: Mutex<WalState>,
    sync_on_write: bool,
}

impl WriteAheadLog {
    /// Open or create a WAL file.
    ///
    /// An existing file is scanned for its last valid sequence; a new one gets
    /// the header written.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures and header corruption.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let sequence = if exists && file.metadata()?.len() >= 5 {
            Self::find_last_sequence(path)?
        } else {
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        };

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(WalState {
                writer: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
        })
    }

    fn lock(&self) -> IoResult<MutexGuard<'_, WalState>> {
        self.state.lock().map_err(|_| poisoned())
    }

    /// Append an entry, returning its sequence number.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures; the sequence is only advanced on success.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut state = self.lock()?;
        let candidate = state.sequence + 1;
        let encoded = codec::encode(&WalEntry {
            sequence: candidate,
            timestamp: Utc::now(),
            kind,
        })?;

        state.writer.write_all(&encoded)?;
        state.writer.flush()?;
        if self.sync_on_write {
            state.writer.get_ref().sync_all()?;
        }
        state.sequence = candidate;
        Ok(candidate)
    }

    /// Iterate over all entries, for replay.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or its header is invalid.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Sequence of the last appended entry.
    ///
    /// # Errors
    ///
    /// Fails only on a poisoned lock.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.lock()?.sequence)
    }

    /// WAL file size in bytes.
    ///
    /// # Errors
    ///
    /// Propagates metadata failures.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Reset the log to an empty file after a snapshot has been written.
    ///
    /// The state lock is held throughout so no append can interleave.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn truncate(&self) -> IoResult<()> {
        let mut state = self.lock()?;
        state.writer.flush()?;

        let mut file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        codec::write_header(&mut file)?;
        if self.sync_on_write {
            file.sync_all()?;
        }
        drop(file);

        state.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        state.sequence = 0;
        Ok(())
    }

    fn find_last_sequence(path: &Path) -> IoResult<u64> {
        let mut last = 0;
        for entry in WalIterator::new(path)? {
            match entry {
                Ok(entry) => last = entry.sequence,
                Err(e) => {
                    tracing::warn!(after = last, error = %e, "WAL corruption detected, replay stops here");
                    break;
                }
            }
        }
        Ok(last)
    }
}

/// Iterator over WAL entries.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;
        Ok(Self { reader, file_size })
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.stream_position() {
            Ok(pos) if pos >= self.file_size => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }
        match codec::decode(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            // Torn tail from a crash mid-append.
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_wal_append_and_iterate() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("test.wal");

        let wal = WriteAheadLog::open(&wal_path, false).unwrap();
        wal.append(WalEntryKind::Set {
            key: "stq_t:1".to_string(),
            value: vec![1, 2, 3],
        })
        .unwrap();
        wal.append(WalEntryKind::Remove {
            key: "stq_t:1".to_string(),
        })
        .unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 2);
        drop(wal);

        let wal = WriteAheadLog::open(&wal_path, false).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 2);
        let entries: Vec<_> = wal.iter().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0].kind, WalEntryKind::Set { .. }));
        assert!(matches!(entries[1].kind, WalEntryKind::Remove { .. }));
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("torn.wal");
        {
            let wal = WriteAheadLog::open(&wal_path, true).unwrap();
            wal.append(WalEntryKind::Remove { key: "a".to_string() }).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&[1, 200, 0]).unwrap();
        drop(file);

        let wal = WriteAheadLog::open(&wal_path, true).unwrap();
        assert_eq!(wal.iter().unwrap().count(), 1);
    }

    #[test]
    fn test_truncate_resets_sequence() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(&dir.path().join("t.wal"), false).unwrap();
        wal.append(WalEntryKind::Remove { key: "a".to_string() }).unwrap();
        wal.truncate().unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 0);
        assert_eq!(wal.iter().unwrap().count(), 0);
        assert_eq!(wal.append(WalEntryKind::Remove { key: "b".to_string() }).unwrap(), 1);
    }
}
