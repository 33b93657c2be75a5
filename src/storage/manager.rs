//! Typed, cached access to stored records.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{de::DeserializeOwned, Serialize};

use crate::cache::{Cache, CachePartition, SharedInstance};
use crate::engine::{InstanceRecord, MonitorProfile, ProfileRecord};
use crate::error::{MonitorError, MonitorResult, ValidationError};
use crate::filters::indexer::ids_from_keys;
use crate::filters::{Filter, FilterIndex, FilterIndexer};
use crate::resources::ResourceProfile;
use crate::stats::StatQueueProfile;
use crate::storage::codec::{decode_record, encode_record};
use crate::storage::keys::{filter_index_key, item_key, ItemKind, FILTER_PREFIX};
use crate::storage::traits::{DataDb, StorageError};
use crate::thresholds::ThresholdProfile;

/// Reads through the cache, optionally recording the result (including a
/// miss) back into it.
fn cached<V: Clone>(
    partition: &CachePartition<V>,
    key: &str,
    cache_read: bool,
    cache_write: bool,
    load: impl FnOnce() -> MonitorResult<Option<V>>,
) -> MonitorResult<V> {
    if cache_read {
        if let Some(hit) = partition.get(key) {
            return hit.ok_or(MonitorError::NotFound);
        }
    }
    let loaded = load()?;
    if cache_write {
        partition.set(key, loaded.clone());
    }
    loaded.ok_or(MonitorError::NotFound)
}

/// Database plus cache. Shared by every service of a process.
pub struct DataManager {
    db: Arc<dyn DataDb>,
    cache: Arc<Cache>,
    index_lock: Mutex<()>,
}

impl DataManager {
    #[must_use]
    pub fn new(db: Arc<dyn DataDb>, cache: Arc<Cache>) -> Self {
        Self {
            db,
            cache,
            index_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    #[must_use]
    pub fn db(&self) -> &dyn DataDb {
        self.db.as_ref()
    }

    /// Serializes filter index writers.
    pub fn lock_indexes(&self) -> MutexGuard<'_, ()> {
        self.index_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn indexer(&self) -> FilterIndexer<'_> {
        FilterIndexer::new(self)
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> MonitorResult<Option<T>> {
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> MonitorResult<()> {
        self.db.set(key, encode_record(value)?)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    /// A stored filter, compiled.
    ///
    /// # Errors
    ///
    /// `NotFound`, or a stored filter that no longer validates.
    pub fn get_filter(
        &self,
        tenant: &str,
        id: &str,
        cache_read: bool,
        cache_write: bool,
    ) -> MonitorResult<Arc<Filter>> {
        let key = item_key(FILTER_PREFIX, tenant, id);
        cached(&self.cache.filters, &key, cache_read, cache_write, || {
            match self.read::<Filter>(&key)? {
                Some(mut filter) => {
                    filter.compile()?;
                    Ok(Some(Arc::new(filter)))
                }
                None => Ok(None),
            }
        })
    }

    /// Stores a filter and moves the profiles using it to the index
    /// entries of its new rules.
    ///
    /// # Errors
    ///
    /// Invalid rules or storage failures.
    pub fn set_filter(&self, mut filter: Filter) -> MonitorResult<()> {
        filter.compile()?;
        let key = item_key(FILTER_PREFIX, &filter.tenant, &filter.id);
        self.write(&key, &filter)?;
        let (tenant, id) = (filter.tenant.clone(), filter.id.clone());
        self.cache.filters.set(key, Some(Arc::new(filter)));
        self.indexer().reindex_filter_users(&tenant, &id)?;
        Ok(())
    }

    /// Deletes a filter no profile refers to.
    ///
    /// # Errors
    ///
    /// `FilterInUse`, `NotFound` or storage failures.
    pub fn remove_filter(&self, tenant: &str, id: &str) -> MonitorResult<()> {
        let users = self.indexer().filter_users(tenant, id)?;
        if !users.is_empty() {
            return Err(ValidationError::FilterInUse {
                filter_id: id.to_string(),
                items: users
                    .into_iter()
                    .map(|(kind, item, _)| item_key(kind.profile_prefix(), tenant, &item))
                    .collect(),
            }
            .into());
        }
        let key = item_key(FILTER_PREFIX, tenant, id);
        self.db.remove(&key)?;
        self.cache.filters.set(key, None);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Filter indexes
    // ------------------------------------------------------------------

    /// The index for a profile family and tenant scope; empty when none is
    /// stored.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn get_filter_index(&self, kind: ItemKind, tenant_ctx: &str) -> MonitorResult<Arc<FilterIndex>> {
        let key = filter_index_key(kind, tenant_ctx);
        cached(&self.cache.filter_indexes, &key, true, true, || {
            Ok(Some(Arc::new(self.read::<FilterIndex>(&key)?.unwrap_or_default())))
        })
    }

    /// Replaces a whole index. An empty index deletes the key.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn set_filter_index(&self, kind: ItemKind, tenant_ctx: &str, index: FilterIndex) -> MonitorResult<()> {
        let key = filter_index_key(kind, tenant_ctx);
        if index.is_empty() {
            match self.db.remove(&key) {
                Ok(()) | Err(StorageError::KeyNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            self.write(&key, &index)?;
        }
        self.cache.filter_indexes.set(key, Some(Arc::new(index)));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------

    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn get_profile<P: ProfileRecord>(
        &self,
        tenant: &str,
        id: &str,
        cache_read: bool,
        cache_write: bool,
    ) -> MonitorResult<Arc<P>> {
        let key = item_key(P::KIND.profile_prefix(), tenant, id);
        cached(P::partition(&self.cache), &key, cache_read, cache_write, || {
            Ok(self.read::<P>(&key)?.map(Arc::new))
        })
    }

    /// Validates, indexes and stores a profile.
    ///
    /// Indexing runs first so a profile referencing an unknown filter is
    /// rejected before anything is written.
    ///
    /// # Errors
    ///
    /// Validation, unknown filters or storage failures.
    pub fn set_profile<P: ProfileRecord>(&self, profile: P) -> MonitorResult<Arc<P>> {
        profile.validate()?;
        self.indexer().index_item(
            P::KIND,
            profile.tenant(),
            profile.tenant(),
            profile.id(),
            profile.filter_ids(),
        )?;
        let key = item_key(P::KIND.profile_prefix(), profile.tenant(), profile.id());
        self.write(&key, &profile)?;
        let profile = Arc::new(profile);
        P::partition(&self.cache).set(key, Some(Arc::clone(&profile)));
        Ok(profile)
    }

    /// Deletes a profile and its index entries.
    ///
    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn remove_profile<P: ProfileRecord>(&self, tenant: &str, id: &str) -> MonitorResult<()> {
        let key = item_key(P::KIND.profile_prefix(), tenant, id);
        self.db.remove(&key)?;
        self.indexer().remove_item(P::KIND, tenant, id)?;
        P::partition(&self.cache).set(key, None);
        Ok(())
    }

    /// Ids of every stored profile of a family for the tenant.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn profile_ids(&self, kind: ItemKind, tenant: &str) -> MonitorResult<Vec<String>> {
        let prefix = kind.profile_prefix();
        let keys = self.db.keys_for_prefix(&format!("{prefix}{tenant}:"))?;
        Ok(ids_from_keys(keys, prefix, tenant))
    }

    /// Filter ids of one stored profile, whatever its family.
    ///
    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn profile_filter_ids(&self, kind: ItemKind, tenant: &str, id: &str) -> MonitorResult<Vec<String>> {
        let filter_ids = match kind {
            ItemKind::StatQueueProfile => self
                .get_profile::<StatQueueProfile>(tenant, id, true, true)?
                .filter_ids()
                .to_vec(),
            ItemKind::ResourceProfile => self
                .get_profile::<ResourceProfile>(tenant, id, true, true)?
                .filter_ids()
                .to_vec(),
            ItemKind::ThresholdProfile => self
                .get_profile::<ThresholdProfile>(tenant, id, true, true)?
                .filter_ids()
                .to_vec(),
        };
        Ok(filter_ids)
    }

    pub fn get_stat_queue_profile(&self, tenant: &str, id: &str) -> MonitorResult<Arc<StatQueueProfile>> {
        self.get_profile(tenant, id, true, true)
    }

    pub fn set_stat_queue_profile(&self, profile: StatQueueProfile) -> MonitorResult<Arc<StatQueueProfile>> {
        self.set_profile(profile)
    }

    pub fn remove_stat_queue_profile(&self, tenant: &str, id: &str) -> MonitorResult<()> {
        self.remove_profile::<StatQueueProfile>(tenant, id)
    }

    pub fn get_resource_profile(&self, tenant: &str, id: &str) -> MonitorResult<Arc<ResourceProfile>> {
        self.get_profile(tenant, id, true, true)
    }

    pub fn set_resource_profile(&self, profile: ResourceProfile) -> MonitorResult<Arc<ResourceProfile>> {
        self.set_profile(profile)
    }

    pub fn remove_resource_profile(&self, tenant: &str, id: &str) -> MonitorResult<()> {
        self.remove_profile::<ResourceProfile>(tenant, id)
    }

    pub fn get_threshold_profile(&self, tenant: &str, id: &str) -> MonitorResult<Arc<ThresholdProfile>> {
        self.get_profile(tenant, id, true, true)
    }

    pub fn set_threshold_profile(&self, profile: ThresholdProfile) -> MonitorResult<Arc<ThresholdProfile>> {
        self.set_profile(profile)
    }

    pub fn remove_threshold_profile(&self, tenant: &str, id: &str) -> MonitorResult<()> {
        self.remove_profile::<ThresholdProfile>(tenant, id)
    }

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    /// The shared instance, loading it from storage on a cache miss.
    ///
    /// Misses are not cached: an instance created in memory must never be
    /// shadowed by an absent record.
    ///
    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn get_instance<I: InstanceRecord>(
        &self,
        tenant: &str,
        id: &str,
        cache_read: bool,
        cache_write: bool,
    ) -> MonitorResult<SharedInstance<I>> {
        let key = item_key(I::PREFIX, tenant, id);
        let partition = I::partition(&self.cache);
        if cache_read {
            if let Some(Some(hit)) = partition.get(&key) {
                return Ok(hit);
            }
        }
        let Some(instance) = self.read::<I>(&key)? else {
            return Err(MonitorError::NotFound);
        };
        let shared = Arc::new(Mutex::new(instance));
        if cache_write {
            return Ok(partition.get_or_insert(&key, shared));
        }
        Ok(shared)
    }

    /// Cached instance only, no storage access.
    #[must_use]
    pub fn cached_instance<I: InstanceRecord>(&self, tenant: &str, id: &str) -> Option<SharedInstance<I>> {
        I::partition(&self.cache).get(&item_key(I::PREFIX, tenant, id)).flatten()
    }

    /// Puts a new instance in the cache unless another caller got there
    /// first; returns whichever is cached.
    pub fn cache_instance<I: InstanceRecord>(&self, instance: I) -> SharedInstance<I> {
        let key = item_key(I::PREFIX, instance.tenant(), instance.id());
        I::partition(&self.cache).get_or_insert(&key, Arc::new(Mutex::new(instance)))
    }

    /// Caches `instance`, dropping whatever handle was cached before.
    pub fn replace_instance<I: InstanceRecord>(&self, instance: I) -> SharedInstance<I> {
        let key = item_key(I::PREFIX, instance.tenant(), instance.id());
        let shared = Arc::new(Mutex::new(instance));
        I::partition(&self.cache).set(key, Some(Arc::clone(&shared)));
        shared
    }

    /// Writes an instance. The cache is not touched.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn set_instance<I: InstanceRecord>(&self, instance: &I) -> MonitorResult<()> {
        self.write(&item_key(I::PREFIX, instance.tenant(), instance.id()), instance)
    }

    /// Drops an instance from storage and cache. Absent records are fine:
    /// instances of unstored profiles only ever live in the cache.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn remove_instance<I: InstanceRecord>(&self, tenant: &str, id: &str) -> MonitorResult<()> {
        let key = item_key(I::PREFIX, tenant, id);
        match self.db.remove(&key) {
            Ok(()) | Err(StorageError::KeyNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        I::partition(&self.cache).remove(&key);
        Ok(())
    }

    /// Ids of the tenant's persisted instances.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn instance_ids<I: InstanceRecord>(&self, tenant: &str) -> MonitorResult<Vec<String>> {
        let keys = self.db.keys_for_prefix(&format!("{}{tenant}:", I::PREFIX))?;
        Ok(ids_from_keys(keys, I::PREFIX, tenant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lock_instance;
    use crate::filters::FilterRule;
    use crate::stats::StatQueue;
    use crate::storage::InMemoryDb;

    fn dm() -> (Arc<InMemoryDb>, DataManager) {
        let db = Arc::new(InMemoryDb::new());
        let dm = DataManager::new(Arc::clone(&db) as Arc<dyn DataDb>, Arc::new(Cache::new()));
        (db, dm)
    }

    #[test]
    fn test_filter_miss_is_cached_until_set() {
        let (db, dm) = dm();
        assert!(dm.get_filter("t", "F1", true, true).unwrap_err().is_not_found());
        assert_eq!(dm.cache().filters.get("ftr_t:F1"), Some(None));

        dm.set_filter(Filter::new(
            "t",
            "F1",
            vec![FilterRule::parse_inline("*string:~Account:1001").unwrap()],
        ))
        .unwrap();
        assert_eq!(dm.get_filter("t", "F1", true, true).unwrap().rules.len(), 1);
        assert!(db.get("ftr_t:F1").unwrap().is_some());

        dm.remove_filter("t", "F1").unwrap();
        assert!(dm.get_filter("t", "F1", true, true).unwrap_err().is_not_found());
        assert!(dm.remove_filter("t", "F1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_filter_in_use_is_not_removed() {
        let (db, dm) = dm();
        dm.set_filter(Filter::new(
            "t",
            "F1",
            vec![FilterRule::parse_inline("*string:~Account:1001").unwrap()],
        ))
        .unwrap();
        let mut p = StatQueueProfile::new("t", "SQ1");
        p.filter_ids = vec!["F1".to_string()];
        dm.set_stat_queue_profile(p).unwrap();

        let err = dm.remove_filter("t", "F1").unwrap_err();
        assert_eq!(err.to_string(), "Validation error: Filter F1 is used by sqp_t:SQ1");
        assert!(db.get("ftr_t:F1").unwrap().is_some());

        dm.remove_stat_queue_profile("t", "SQ1").unwrap();
        dm.remove_filter("t", "F1").unwrap();
    }

    #[test]
    fn test_profile_with_unknown_filter_is_not_written() {
        let (db, dm) = dm();
        let mut p = StatQueueProfile::new("t", "SQ1");
        p.filter_ids = vec!["FLTR_MISSING".to_string()];
        let err = dm.set_stat_queue_profile(p).unwrap_err();
        assert_eq!(err.to_string(), "Validation error: NOT_FOUND:FLTR_MISSING");
        assert!(db.get("sqp_t:SQ1").unwrap().is_none());
    }

    #[test]
    fn test_profile_ids_are_tenant_scoped() {
        let (_, dm) = dm();
        dm.set_stat_queue_profile(StatQueueProfile::new("t", "SQ1")).unwrap();
        dm.set_stat_queue_profile(StatQueueProfile::new("t", "SQ2")).unwrap();
        dm.set_stat_queue_profile(StatQueueProfile::new("tx", "SQ3")).unwrap();
        assert_eq!(dm.profile_ids(ItemKind::StatQueueProfile, "t").unwrap(), vec!["SQ1", "SQ2"]);

        // Reads bypassing the cache hit storage.
        let p = dm.get_profile::<StatQueueProfile>("tx", "SQ3", false, false).unwrap();
        assert_eq!(p.id, "SQ3");
    }

    #[test]
    fn test_instances_share_one_cached_handle() {
        let (_, dm) = dm();
        let profile = StatQueueProfile::new("t", "SQ1");
        let a = dm.cache_instance(StatQueue::new(&profile));
        let b = dm.cache_instance(StatQueue::new(&profile));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(dm.instance_ids::<StatQueue>("t").unwrap().is_empty());

        dm.set_instance(&*lock_instance(&a)).unwrap();
        assert_eq!(dm.instance_ids::<StatQueue>("t").unwrap(), vec!["SQ1"]);

        dm.remove_instance::<StatQueue>("t", "SQ1").unwrap();
        assert!(dm.cached_instance::<StatQueue>("t", "SQ1").is_none());
        assert!(dm
            .get_instance::<StatQueue>("t", "SQ1", true, true)
            .unwrap_err()
            .is_not_found());
        // Removing again is not an error.
        dm.remove_instance::<StatQueue>("t", "SQ1").unwrap();
    }

    #[test]
    fn test_loaded_instance_is_cached() {
        let (_, dm) = dm();
        let profile = StatQueueProfile::new("t", "SQ1");
        dm.set_instance(&StatQueue::new(&profile)).unwrap();
        let a = dm.get_instance::<StatQueue>("t", "SQ1", true, true).unwrap();
        let b = dm.get_instance::<StatQueue>("t", "SQ1", true, true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
