//! Shared in-process cache.
//!
//! One [`Cache`] is built per process and injected into the data manager and
//! the services. Each partition maps a storage key to `Some(value)` or to
//! `None`, the latter recording a known miss so repeated lookups of absent
//! records do not reach the database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::filters::{Filter, FilterIndex};
use crate::resources::{Resource, ResourceProfile};
use crate::stats::{StatQueue, StatQueueProfile};
use crate::thresholds::{Threshold, ThresholdProfile};

/// A typed key/value partition.
#[derive(Debug)]
pub struct CachePartition<V: Clone> {
    name: &'static str,
    items: RwLock<HashMap<String, Option<V>>>,
}

impl<V: Clone> CachePartition<V> {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            items: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// `None` when the key was never cached; `Some(None)` for a cached miss.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Option<V>> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Option<V>) {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    /// Inserts `value` unless the key already holds a value, returning the
    /// value that ends up cached.
    pub fn get_or_insert(&self, key: &str, value: V) -> V {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        match items.get(key) {
            Some(Some(existing)) => existing.clone(),
            _ => {
                items.insert(key.to_string(), Some(value.clone()));
                value
            }
        }
    }

    /// Rewrites one entry under the partition lock. `f` sees the cached
    /// value, if any; returning `None` drops the entry.
    pub fn update(&self, key: &str, f: impl FnOnce(Option<V>) -> Option<V>) {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = f(items.remove(key).flatten()) {
            items.insert(key.to_string(), Some(value));
        }
    }

    pub fn remove(&self, key: &str) -> Option<Option<V>> {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn clear(&self) {
        self.items.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Instances are shared so the engine can lock one without holding the
/// partition lock.
pub type SharedInstance<T> = Arc<Mutex<T>>;

/// All cache partitions.
#[derive(Debug)]
pub struct Cache {
    pub filters: CachePartition<Arc<Filter>>,
    pub filter_indexes: CachePartition<Arc<FilterIndex>>,
    pub stat_queue_profiles: CachePartition<Arc<StatQueueProfile>>,
    pub stat_queues: CachePartition<SharedInstance<StatQueue>>,
    pub resource_profiles: CachePartition<Arc<ResourceProfile>>,
    pub resources: CachePartition<SharedInstance<Resource>>,
    pub threshold_profiles: CachePartition<Arc<ThresholdProfile>>,
    pub thresholds: CachePartition<SharedInstance<Threshold>>,
    /// `tenant:usage_id` to the resource ids that hold that usage.
    pub event_resources: CachePartition<Arc<Vec<String>>>,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            filters: CachePartition::new("filters"),
            filter_indexes: CachePartition::new("filter_indexes"),
            stat_queue_profiles: CachePartition::new("stat_queue_profiles"),
            stat_queues: CachePartition::new("stat_queues"),
            resource_profiles: CachePartition::new("resource_profiles"),
            resources: CachePartition::new("resources"),
            threshold_profiles: CachePartition::new("threshold_profiles"),
            thresholds: CachePartition::new("thresholds"),
            event_resources: CachePartition::new("event_resources"),
        }
    }
}

impl Cache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every cached entry.
    pub fn clear(&self) {
        self.filters.clear();
        self.filter_indexes.clear();
        self.stat_queue_profiles.clear();
        self.stat_queues.clear();
        self.resource_profiles.clear();
        self.resources.clear();
        self.threshold_profiles.clear();
        self.thresholds.clear();
        self.event_resources.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_miss_is_distinct_from_absent() {
        let part: CachePartition<u32> = CachePartition::new("test");
        assert_eq!(part.get("a"), None);
        part.set("a", None);
        assert_eq!(part.get("a"), Some(None));
        part.set("a", Some(1));
        assert_eq!(part.get("a"), Some(Some(1)));
        assert_eq!(part.remove("a"), Some(Some(1)));
        assert!(part.is_empty());
    }

    #[test]
    fn test_get_or_insert_keeps_first_value() {
        let part: CachePartition<Arc<u32>> = CachePartition::new("test");
        let first = part.get_or_insert("k", Arc::new(1));
        let second = part.get_or_insert("k", Arc::new(2));
        assert!(Arc::ptr_eq(&first, &second));

        part.set("miss", None);
        assert_eq!(*part.get_or_insert("miss", Arc::new(3)), 3);
    }
}
