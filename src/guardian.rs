//! Named advisory locks.
//!
//! Each key owns a one-slot channel holding a single token. Taking the token
//! takes the lock; putting it back releases it. Keys are always acquired in
//! sorted order so two callers with overlapping key sets cannot deadlock.
//!
//! The wait is bounded by the configured locking timeout. When it expires
//! the section runs anyway, without exclusivity on the keys it failed to
//! take, and a warning is logged. A zero timeout waits forever.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::storage::keys::item_key;

#[derive(Debug)]
struct ItemLock {
    token_tx: Sender<()>,
    token_rx: Receiver<()>,
    users: usize,
}

impl ItemLock {
    fn new() -> Self {
        let (token_tx, token_rx) = bounded(1);
        // A fresh channel has room for exactly this one token.
        let _ = token_tx.try_send(());
        Self {
            token_tx,
            token_rx,
            users: 0,
        }
    }
}

/// Per-key lock registry. Entries exist only while someone references them.
#[derive(Debug, Default)]
pub struct Guardian {
    locks: Mutex<HashMap<String, ItemLock>>,
}

struct Held {
    key: String,
    token_tx: Sender<()>,
    token_rx: Receiver<()>,
    owned: bool,
}

/// Returns tokens and drops registry references, also on unwind.
struct Release<'a> {
    guardian: &'a Guardian,
    held: Vec<Held>,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        for h in &self.held {
            if h.owned {
                let _ = h.token_tx.try_send(());
            }
        }
        let mut locks = self.guardian.registry();
        for h in &self.held {
            if let Some(entry) = locks.get_mut(&h.key) {
                entry.users -= 1;
                if entry.users == 0 {
                    locks.remove(&h.key);
                }
            }
        }
    }
}

impl Guardian {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, ItemLock>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` while holding every key.
    pub fn guard<T>(&self, timeout: Duration, keys: &[String], f: impl FnOnce() -> T) -> T {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let mut release = Release {
            guardian: self,
            held: Vec::with_capacity(keys.len()),
        };
        {
            let mut locks = self.registry();
            for key in keys {
                let entry = locks.entry(key.clone()).or_insert_with(ItemLock::new);
                entry.users += 1;
                release.held.push(Held {
                    key,
                    token_tx: entry.token_tx.clone(),
                    token_rx: entry.token_rx.clone(),
                    owned: false,
                });
            }
        }

        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        for h in &mut release.held {
            h.owned = match deadline {
                None => h.token_rx.recv().is_ok(),
                Some(d) => h.token_rx.recv_deadline(d).is_ok(),
            };
            if !h.owned {
                tracing::warn!(key = %h.key, ?timeout, "lock wait timed out, running without exclusivity");
            }
        }

        f()
    }

    /// Guard keyed by `<prefix><tenant>:<id>` for each id.
    pub fn guard_ids<T>(
        &self,
        timeout: Duration,
        prefix: &str,
        tenant: &str,
        ids: &[&str],
        f: impl FnOnce() -> T,
    ) -> T {
        let keys: Vec<String> = ids.iter().map(|id| item_key(prefix, tenant, id)).collect();
        self.guard(timeout, &keys, f)
    }

    /// Number of keys currently referenced.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
