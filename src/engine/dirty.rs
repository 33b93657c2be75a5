//! Deduplicating FIFO of instance keys awaiting persistence.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct Inner {
    order: VecDeque<String>,
    queued: HashSet<String>,
}

/// Keys are `tenant:id`. A key already queued keeps its position.
#[derive(Debug, Default)]
pub struct DirtyQueue {
    inner: Mutex<Inner>,
}

impl DirtyQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a key; returns false if it was already queued.
    pub fn push(&self, key: impl Into<String>) -> bool {
        let key = key.into();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.queued.insert(key.clone()) {
            return false;
        }
        inner.order.push_back(key);
        true
    }

    /// Takes the oldest key.
    pub fn pop(&self) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let key = inner.order.pop_front()?;
        inner.queued.remove(&key);
        Some(key)
    }

    /// Forgets a key, e.g. after its instance was deleted.
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.queued.remove(key) {
            inner.order.retain(|k| k != key);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
