//! The statistics service.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use uuid::Uuid;

use crate::config::StatsConfig;
use crate::engine::{
    apply_store_action, backup, finish, instance_for, lock_instance, mark_changed, persist_instance, track,
    BackupScheduler, BackupTarget, DirtyQueue, MatchContext,
};
use crate::error::{MonitorError, MonitorResult};
use crate::event::{fields, CgrEvent, TenantId};
use crate::filters::FilterPredicate;
use crate::guardian::Guardian;
use crate::storage::keys::STAT_QUEUE_PREFIX;
use crate::storage::DataManager;
use crate::thresholds::{ThresholdEventArgs, ThresholdProcessor};

use super::profile::StatQueueProfile;
use super::queue::StatQueue;

/// Matches events to stat queues and keeps their metrics.
pub struct StatService {
    dm: Arc<DataManager>,
    filters: Arc<dyn FilterPredicate>,
    guardian: Arc<Guardian>,
    cfg: StatsConfig,
    locking_timeout: Duration,
    dirty: DirtyQueue,
    thresholds: Option<Arc<dyn ThresholdProcessor>>,
    backup: Mutex<Option<BackupScheduler>>,
}

impl StatService {
    #[must_use]
    pub fn new(
        dm: Arc<DataManager>,
        filters: Arc<dyn FilterPredicate>,
        guardian: Arc<Guardian>,
        cfg: StatsConfig,
        locking_timeout: Duration,
    ) -> Self {
        Self {
            dm,
            filters,
            guardian,
            cfg,
            locking_timeout,
            dirty: DirtyQueue::new(),
            thresholds: None,
            backup: Mutex::new(None),
        }
    }

    /// Enables the cascade of metric updates into thresholds.
    #[must_use]
    pub fn with_thresholds(mut self, thresholds: Arc<dyn ThresholdProcessor>) -> Self {
        self.thresholds = Some(thresholds);
        self
    }

    /// Starts the backup thread when the store interval is periodic.
    ///
    /// # Errors
    ///
    /// The thread could not be spawned.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        let Some(interval) = self.cfg.store_interval.backup_period() else {
            return Ok(());
        };
        let target: Arc<dyn BackupTarget> = Arc::clone(self) as Arc<dyn BackupTarget>;
        let scheduler = BackupScheduler::start(Arc::downgrade(&target), self.name(), interval)?;
        *self.backup.lock().unwrap_or_else(PoisonError::into_inner) = Some(scheduler);
        tracing::info!(?interval, "stats backup started");
        Ok(())
    }

    /// Stops the backup thread and writes whatever is still dirty.
    pub fn shutdown(&self) {
        if let Some(mut scheduler) = self.backup.lock().unwrap_or_else(PoisonError::into_inner).take() {
            scheduler.stop();
        }
        let stats = backup::drain(self);
        tracing::info!(stored = stats.stored, failed = stats.failed, "stats service stopped");
    }

    fn matcher(&self) -> MatchContext<'_> {
        MatchContext {
            dm: &self.dm,
            filters: self.filters.as_ref(),
            opts: &self.cfg.indexing,
        }
    }

    fn guard<T>(&self, tenant: &str, id: &str, f: impl FnOnce() -> T) -> T {
        self.guardian
            .guard_ids(self.locking_timeout, STAT_QUEUE_PREFIX, tenant, &[id], f)
    }

    /// Keys waiting for the backup thread.
    #[must_use]
    pub const fn dirty_queue(&self) -> &DirtyQueue {
        &self.dirty
    }

    /// Feeds an event into every matching queue.
    ///
    /// Returns the ids of the queues that received it.
    ///
    /// # Errors
    ///
    /// `MandatoryIeMissing` for an incomplete event, `NotFound` when no queue
    /// matches, `PartiallyExecuted` when a queue update or its cascade failed.
    pub fn process_event(&self, event: &CgrEvent, stat_ids: Option<&[String]>) -> MonitorResult<Vec<String>> {
        event.validate()?;
        let profiles = self.matcher().match_profiles::<StatQueueProfile>(event, stat_ids)?;

        let mut ids = Vec::with_capacity(profiles.len());
        let mut failed = 0;
        for profile in &profiles {
            ids.push(profile.id.clone());
            let processed = self.guard(&profile.tenant, &profile.id, || self.process_queue(profile, event));
            let result = processed.and_then(|metrics| self.cascade(profile, metrics));
            if let Err(e) = result {
                tracing::warn!(tenant = %profile.tenant, queue = %profile.id, event = %event.id, error = %e, "stat queue processing failed");
                failed += 1;
            }
        }
        finish(ids, failed)
    }

    fn process_queue(&self, profile: &StatQueueProfile, event: &CgrEvent) -> MonitorResult<BTreeMap<String, f64>> {
        let shared = instance_for(&self.dm, profile, StatQueue::new)?;
        let mut sq = lock_instance(&shared);
        track(&mut *sq, profile.stored);
        sq.set_ttl(profile.ttl);

        let processed = sq.process_event(profile, event, self.filters.as_ref());
        let action = mark_changed(&mut *sq, self.cfg.store_interval);
        apply_store_action(&self.dm, &self.dirty, &mut *sq, action)?;
        processed?;
        Ok(sq.float_metrics())
    }

    /// Sends the queue's metrics to thresholds. `NotFound` downstream means
    /// no threshold cares, which is fine.
    fn cascade(&self, profile: &StatQueueProfile, metrics: BTreeMap<String, f64>) -> MonitorResult<()> {
        let Some(thresholds) = &self.thresholds else {
            return Ok(());
        };
        let Some(threshold_ids) = profile.cascade_ids() else {
            return Ok(());
        };

        let mut event = CgrEvent::new(profile.tenant.clone(), Uuid::new_v4().to_string())
            .with_field(fields::EVENT_TYPE, fields::STAT_UPDATE)
            .with_field(fields::STAT_ID, profile.id.clone());
        for (metric_id, value) in metrics {
            event = event.with_field(metric_id, value);
        }
        let args = ThresholdEventArgs {
            threshold_ids: (!threshold_ids.is_empty()).then(|| threshold_ids.to_vec()),
            event,
        };
        match thresholds.process_event(args) {
            Ok(_) | Err(MonitorError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Ids of the queues an event would reach. Nothing is mutated.
    ///
    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn get_stat_queues_for_event(
        &self,
        event: &CgrEvent,
        stat_ids: Option<&[String]>,
    ) -> MonitorResult<Vec<String>> {
        event.validate()?;
        let profiles = self.matcher().match_profiles::<StatQueueProfile>(event, stat_ids)?;
        Ok(profiles.iter().map(|p| p.id.clone()).collect())
    }

    /// Snapshot of one queue.
    ///
    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn get_stat_queue(&self, tid: &TenantId) -> MonitorResult<StatQueue> {
        let missing = tid.missing_fields();
        if !missing.is_empty() {
            return Err(MonitorError::mandatory_missing(missing));
        }
        self.guard(&tid.tenant, &tid.id, || {
            let shared = self.dm.get_instance::<StatQueue>(&tid.tenant, &tid.id, true, true)?;
            let sq = lock_instance(&shared).clone();
            Ok(sq)
        })
    }

    /// Ids of the tenant's persisted queues.
    ///
    /// # Errors
    ///
    /// `NotFound` when there are none.
    pub fn get_queue_ids(&self, tenant: &str) -> MonitorResult<Vec<String>> {
        let ids = self.dm.instance_ids::<StatQueue>(tenant)?;
        if ids.is_empty() {
            return Err(MonitorError::NotFound);
        }
        Ok(ids)
    }

    /// # Errors
    ///
    /// As [`Self::get_stat_queue`].
    pub fn get_queue_string_metrics(&self, tid: &TenantId) -> MonitorResult<BTreeMap<String, String>> {
        Ok(self.get_stat_queue(tid)?.string_metrics())
    }

    /// # Errors
    ///
    /// As [`Self::get_stat_queue`].
    pub fn get_queue_float_metrics(&self, tid: &TenantId) -> MonitorResult<BTreeMap<String, f64>> {
        Ok(self.get_stat_queue(tid)?.float_metrics())
    }

    /// Stores a profile and makes sure its queue exists. The queue is reset
    /// when the metric layout changed.
    ///
    /// # Errors
    ///
    /// Validation, unknown filters or storage failures.
    pub fn set_stat_queue_profile(&self, profile: StatQueueProfile) -> MonitorResult<()> {
        let previous = match self.dm.get_stat_queue_profile(&profile.tenant, &profile.id) {
            Ok(p) => Some(p),
            Err(MonitorError::NotFound) => None,
            Err(e) => return Err(e),
        };
        let profile = self.dm.set_stat_queue_profile(profile)?;
        let layout_changed = previous
            .as_ref()
            .map_or(true, |old| old.metrics != profile.metrics || old.min_items != profile.min_items);

        self.guard(&profile.tenant, &profile.id, || {
            let exists = match self.dm.get_instance::<StatQueue>(&profile.tenant, &profile.id, true, true) {
                Ok(_) => true,
                Err(MonitorError::NotFound) => false,
                Err(e) => return Err(e),
            };
            if exists && !layout_changed {
                return Ok(());
            }
            let mut sq = StatQueue::new(&profile);
            track(&mut sq, profile.stored);
            self.dm.set_instance(&sq)?;
            self.dm.replace_instance(sq);
            tracing::debug!(tenant = %profile.tenant, queue = %profile.id, "stat queue (re)created");
            Ok(())
        })
    }

    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn get_stat_queue_profile(&self, tid: &TenantId) -> MonitorResult<Arc<StatQueueProfile>> {
        self.dm.get_stat_queue_profile(&tid.tenant, &tid.id)
    }

    /// Deletes a profile together with its queue.
    ///
    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn remove_stat_queue_profile(&self, tid: &TenantId) -> MonitorResult<()> {
        self.dm.remove_stat_queue_profile(&tid.tenant, &tid.id)?;
        self.guard(&tid.tenant, &tid.id, || {
            self.dm.remove_instance::<StatQueue>(&tid.tenant, &tid.id)
        })?;
        self.dirty.remove(&tid.to_string());
        Ok(())
    }
}

impl BackupTarget for StatService {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn dirty_queue(&self) -> &DirtyQueue {
        &self.dirty
    }

    fn persist_key(&self, key: &str) -> MonitorResult<()> {
        let tid = TenantId::parse(key).ok_or_else(|| MonitorError::internal(format!("malformed dirty key {key}")))?;
        // Under the guard: an instance removed first stays removed.
        self.guard(&tid.tenant, &tid.id, || {
            let Some(shared) = self.dm.cached_instance::<StatQueue>(&tid.tenant, &tid.id) else {
                return Ok(());
            };
            let res = persist_instance(&self.dm, &mut *lock_instance(&shared));
            res
        })
    }
}

impl Drop for StatService {
    fn drop(&mut self) {
        if let Some(mut scheduler) = self.backup.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            scheduler.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::config::StoreInterval;
    use crate::filters::FilterService;
    use crate::storage::{DataDb, InMemoryDb};

    fn service(store_interval: StoreInterval) -> (Arc<InMemoryDb>, StatService) {
        let db = Arc::new(InMemoryDb::new());
        let dm = Arc::new(DataManager::new(Arc::clone(&db) as Arc<dyn DataDb>, Arc::new(Cache::new())));
        let filters = Arc::new(FilterService::new(Arc::clone(&dm), false));
        let cfg = StatsConfig {
            enabled: true,
            store_interval,
            ..StatsConfig::default()
        };
        (db, StatService::new(dm, filters, Arc::new(Guardian::new()), cfg, Duration::ZERO))
    }

    fn profile(id: &str, weight: f64, blocker: bool) -> StatQueueProfile {
        let mut p = StatQueueProfile::new("cgrates.org", id).with_metrics(&["*asr", "*tcd"]);
        p.filter_ids = vec!["*string:~Account:1001".to_string()];
        p.weight = weight;
        p.blocker = blocker;
        p.stored = true;
        p
    }

    fn call(id: &str) -> CgrEvent {
        CgrEvent::new("cgrates.org", id)
            .with_field("Account", "1001")
            .with_field("AnswerTime", "2024-01-01T10:00:00Z")
            .with_field("Usage", "1m")
    }

    #[test]
    fn test_process_event_updates_matching_queue() {
        let (_, svc) = service(StoreInterval::Never);
        svc.set_stat_queue_profile(profile("SQ1", 10.0, false)).unwrap();

        assert_eq!(svc.process_event(&call("e1"), None).unwrap(), vec!["SQ1"]);
        let metrics = svc
            .get_queue_string_metrics(&TenantId::new("cgrates.org", "SQ1"))
            .unwrap();
        assert_eq!(metrics["*asr"], "100%");
        assert_eq!(metrics["*tcd"], "1m");

        let other = CgrEvent::new("cgrates.org", "e2").with_field("Account", "2002");
        assert!(svc.process_event(&other, None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_missing_mandatory_fields() {
        let (_, svc) = service(StoreInterval::Never);
        let err = svc.process_event(&CgrEvent::new("", "e1"), None).unwrap_err();
        assert_eq!(err.to_string(), "MANDATORY_IE_MISSING: [Tenant Event]");
    }

    #[test]
    fn test_synchronous_store_persists_inside_process_event() {
        let (db, svc) = service(StoreInterval::Synchronous);
        svc.set_stat_queue_profile(profile("SQ1", 10.0, false)).unwrap();
        svc.process_event(&call("e1"), None).unwrap();

        let stored: StatQueue =
            crate::storage::codec::decode_record(&db.get("stq_cgrates.org:SQ1").unwrap().unwrap()).unwrap();
        assert_eq!(stored.sq_items.len(), 1);
        assert!(svc.dirty_queue().is_empty());
    }

    #[test]
    fn test_periodic_store_leaves_key_dirty_until_drain() {
        let (db, svc) = service(StoreInterval::Every(Duration::from_secs(5)));
        svc.set_stat_queue_profile(profile("SQ1", 10.0, false)).unwrap();
        svc.process_event(&call("e1"), None).unwrap();
        assert_eq!(svc.dirty_queue().len(), 1);

        let before: StatQueue =
            crate::storage::codec::decode_record(&db.get("stq_cgrates.org:SQ1").unwrap().unwrap()).unwrap();
        assert!(before.sq_items.is_empty());

        svc.shutdown();
        assert!(svc.dirty_queue().is_empty());
        let after: StatQueue =
            crate::storage::codec::decode_record(&db.get("stq_cgrates.org:SQ1").unwrap().unwrap()).unwrap();
        assert_eq!(after.sq_items.len(), 1);
    }

    #[test]
    fn test_higher_weight_blocker_stops_lower_queues() {
        let (_, svc) = service(StoreInterval::Never);
        svc.set_stat_queue_profile(profile("SQ_HIGH", 20.0, true)).unwrap();
        svc.set_stat_queue_profile(profile("SQ_LOW", 10.0, false)).unwrap();

        assert_eq!(svc.get_stat_queues_for_event(&call("e1"), None).unwrap(), vec!["SQ_HIGH"]);
        svc.process_event(&call("e1"), None).unwrap();
        let low = svc.get_stat_queue(&TenantId::new("cgrates.org", "SQ_LOW")).unwrap();
        assert!(low.sq_items.is_empty());
    }

    #[test]
    fn test_profile_update_resets_queue_only_on_layout_change() {
        let (_, svc) = service(StoreInterval::Never);
        svc.set_stat_queue_profile(profile("SQ1", 10.0, false)).unwrap();
        svc.process_event(&call("e1"), None).unwrap();

        svc.set_stat_queue_profile(profile("SQ1", 30.0, false)).unwrap();
        let tid = TenantId::new("cgrates.org", "SQ1");
        assert_eq!(svc.get_stat_queue(&tid).unwrap().sq_items.len(), 1);

        svc.set_stat_queue_profile(profile("SQ1", 30.0, false).with_metrics(&["*acd"]))
            .unwrap();
        let sq = svc.get_stat_queue(&tid).unwrap();
        assert!(sq.sq_items.is_empty());
        assert!(sq.sq_metrics.contains_key("*acd"));
    }

    #[test]
    fn test_remove_profile_drops_queue() {
        let (_, svc) = service(StoreInterval::Never);
        svc.set_stat_queue_profile(profile("SQ1", 10.0, false)).unwrap();
        assert_eq!(svc.get_queue_ids("cgrates.org").unwrap(), vec!["SQ1"]);

        let tid = TenantId::new("cgrates.org", "SQ1");
        svc.remove_stat_queue_profile(&tid).unwrap();
        assert!(svc.get_stat_queue(&tid).unwrap_err().is_not_found());
        assert!(svc.get_queue_ids("cgrates.org").unwrap_err().is_not_found());
        assert!(svc.process_event(&call("e1"), None).unwrap_err().is_not_found());
    }
}
