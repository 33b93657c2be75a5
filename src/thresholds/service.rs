use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::Utc;

use crate::config::ThresholdsConfig;
use crate::engine::{
    apply_store_action, backup, finish, lock_instance, mark_changed, persist_instance, track, BackupScheduler,
    BackupTarget, DirtyQueue, MatchContext,
};
use crate::error::{MonitorError, MonitorResult};
use crate::event::{CgrEvent, TenantId};
use crate::filters::FilterPredicate;
use crate::guardian::Guardian;
use crate::storage::keys::THRESHOLD_PREFIX;
use crate::storage::DataManager;

use super::{ActionExecutor, Threshold, ThresholdEventArgs, ThresholdProcessor, ThresholdProfile};

/// Counts threshold hits and triggers their actions.
pub struct ThresholdService {
    dm: Arc<DataManager>,
    filters: Arc<dyn FilterPredicate>,
    guardian: Arc<Guardian>,
    cfg: ThresholdsConfig,
    locking_timeout: Duration,
    actions: Arc<dyn ActionExecutor>,
    dirty: DirtyQueue,
    backup: Mutex<Option<BackupScheduler>>,
}

impl ThresholdService {
    #[must_use]
    pub fn new(
        dm: Arc<DataManager>,
        filters: Arc<dyn FilterPredicate>,
        guardian: Arc<Guardian>,
        cfg: ThresholdsConfig,
        locking_timeout: Duration,
        actions: Arc<dyn ActionExecutor>,
    ) -> Self {
        Self {
            dm,
            filters,
            guardian,
            cfg,
            locking_timeout,
            actions,
            dirty: DirtyQueue::new(),
            backup: Mutex::new(None),
        }
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
        Ok(())
    }

    /// Stops the backup thread and writes whatever is still dirty.
    pub fn shutdown(&self) {
        if let Some(mut scheduler) = self.backup.lock().unwrap_or_else(PoisonError::into_inner).take() {
            scheduler.stop();
        }
        let stats = backup::drain(self);
        tracing::info!(stored = stats.stored, failed = stats.failed, "threshold service stopped");
    }

    #[must_use]
    pub const fn dirty_queue(&self) -> &DirtyQueue {
        &self.dirty
    }

    fn guard<T>(&self, tenant: &str, id: &str, f: impl FnOnce() -> T) -> T {
        self.guardian
            .guard_ids(self.locking_timeout, THRESHOLD_PREFIX, tenant, &[id], f)
    }

    /// Matching profiles whose threshold still exists. A threshold removed
    /// after reaching `max_hits` stays gone until its profile is set again.
    fn matching(&self, event: &CgrEvent, threshold_ids: Option<&[String]>) -> MonitorResult<Vec<Arc<ThresholdProfile>>> {
        event.validate()?;
        let matcher = MatchContext {
            dm: &self.dm,
            filters: self.filters.as_ref(),
            opts: &self.cfg.indexing,
        };
        matcher.match_profiles_with::<ThresholdProfile>(event, threshold_ids, |p| {
            match self.dm.get_instance::<Threshold>(&p.tenant, &p.id, true, true) {
                Ok(_) => Ok(true),
                Err(MonitorError::NotFound) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    /// Counts a hit on every matching threshold and runs due actions.
    ///
    /// # Errors
    ///
    /// `MandatoryIeMissing`, `NotFound`, or `PartiallyExecuted` when actions
    /// or persistence failed for some threshold.
    pub fn process_event(&self, event: &CgrEvent, threshold_ids: Option<&[String]>) -> MonitorResult<Vec<String>> {
        let profiles = self.matching(event, threshold_ids)?;
        let mut ids = Vec::with_capacity(profiles.len());
        let mut failed = 0;
        for profile in &profiles {
            match self.guard(&profile.tenant, &profile.id, || self.process_threshold(profile, event)) {
                Ok(()) => ids.push(profile.id.clone()),
                Err(MonitorError::NotFound) => {}
                Err(e) => {
                    tracing::warn!(tenant = %profile.tenant, threshold = %profile.id, event = %event.id, error = %e, "threshold processing failed");
                    ids.push(profile.id.clone());
                    failed += 1;
                }
            }
        }
        if ids.is_empty() {
            return Err(MonitorError::NotFound);
        }
        finish(ids, failed)
    }

    fn process_threshold(&self, profile: &ThresholdProfile, event: &CgrEvent) -> MonitorResult<()> {
        // Another event may have removed it since matching.
        let shared = self.dm.get_instance::<Threshold>(&profile.tenant, &profile.id, true, true)?;
        let mut th = lock_instance(&shared);
        track(&mut *th, profile.stored);

        let now = Utc::now();
        let mut result = Ok(());
        if th.hit(profile, now) {
            result = self.run_actions(profile, event);
            th.snooze_from(profile, now);
        }

        if th.exhausted(profile) {
            drop(th);
            self.dm.remove_instance::<Threshold>(&profile.tenant, &profile.id)?;
            self.dirty.remove(&TenantId::new(&profile.tenant, &profile.id).to_string());
            tracing::debug!(tenant = %profile.tenant, threshold = %profile.id, "threshold reached max hits");
            return result;
        }

        let action = mark_changed(&mut *th, self.cfg.store_interval);
        apply_store_action(&self.dm, &self.dirty, &mut *th, action)?;
        result
    }

    fn run_actions(&self, profile: &ThresholdProfile, event: &CgrEvent) -> MonitorResult<()> {
        if profile.action_ids.is_empty() {
            return Ok(());
        }
        if !profile.async_actions {
            return self.actions.execute(&profile.tenant, &profile.action_ids, event);
        }

        let actions = Arc::clone(&self.actions);
        let (tenant, action_ids, event) = (profile.tenant.clone(), profile.action_ids.clone(), event.clone());
        thread::Builder::new()
            .name(format!("cgmon-actions-{}", profile.id))
            .spawn(move || {
                if let Err(e) = actions.execute(&tenant, &action_ids, &event) {
                    tracing::warn!(tenant = %tenant, actions = ?action_ids, error = %e, "async threshold actions failed");
                }
            })
            .map_err(|e| MonitorError::internal(format!("spawning action thread: {e}")))?;
        Ok(())
    }

    /// Ids of the thresholds an event would hit. Nothing is mutated.
    ///
    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn get_thresholds_for_event(
        &self,
        event: &CgrEvent,
        threshold_ids: Option<&[String]>,
    ) -> MonitorResult<Vec<String>> {
        Ok(self
            .matching(event, threshold_ids)?
            .iter()
            .map(|p| p.id.clone())
            .collect())
    }

    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn get_threshold(&self, tid: &TenantId) -> MonitorResult<Threshold> {
        let missing = tid.missing_fields();
        if !missing.is_empty() {
            return Err(MonitorError::mandatory_missing(missing));
        }
        self.guard(&tid.tenant, &tid.id, || {
            let shared = self.dm.get_instance::<Threshold>(&tid.tenant, &tid.id, true, true)?;
            let th = lock_instance(&shared).clone();
            Ok(th)
        })
    }

    /// # Errors
    ///
    /// `NotFound` when the tenant has no persisted thresholds.
    pub fn get_threshold_ids(&self, tenant: &str) -> MonitorResult<Vec<String>> {
        let ids = self.dm.instance_ids::<Threshold>(tenant)?;
        if ids.is_empty() {
            return Err(MonitorError::NotFound);
        }
        Ok(ids)
    }

    /// Zeroes hits and snooze.
    ///
    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn reset_threshold(&self, tid: &TenantId) -> MonitorResult<()> {
        let profile = self.dm.get_threshold_profile(&tid.tenant, &tid.id)?;
        self.guard(&tid.tenant, &tid.id, || {
            let shared = self.dm.get_instance::<Threshold>(&tid.tenant, &tid.id, true, true)?;
            let mut th = lock_instance(&shared);
            track(&mut *th, profile.stored);
            th.reset();
            let action = mark_changed(&mut *th, self.cfg.store_interval);
            apply_store_action(&self.dm, &self.dirty, &mut *th, action)
        })
    }

    /// Stores a profile and creates its threshold if there is none.
    ///
    /// # Errors
    ///
    /// Validation, unknown filters or storage failures.
    pub fn set_threshold_profile(&self, profile: ThresholdProfile) -> MonitorResult<()> {
        let profile = self.dm.set_threshold_profile(profile)?;
        self.guard(&profile.tenant, &profile.id, || {
            match self.dm.get_instance::<Threshold>(&profile.tenant, &profile.id, true, true) {
                Ok(_) => Ok(()),
                Err(MonitorError::NotFound) => {
                    let mut th = Threshold::new(&profile);
                    track(&mut th, profile.stored);
                    self.dm.set_instance(&th)?;
                    self.dm.replace_instance(th);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
    }

    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn get_threshold_profile(&self, tid: &TenantId) -> MonitorResult<Arc<ThresholdProfile>> {
        self.dm.get_threshold_profile(&tid.tenant, &tid.id)
    }

    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn remove_threshold_profile(&self, tid: &TenantId) -> MonitorResult<()> {
        self.dm.remove_threshold_profile(&tid.tenant, &tid.id)?;
        self.guard(&tid.tenant, &tid.id, || {
            self.dm.remove_instance::<Threshold>(&tid.tenant, &tid.id)
        })?;
        self.dirty.remove(&tid.to_string());
        Ok(())
    }
}

impl ThresholdProcessor for ThresholdService {
    fn process_event(&self, args: ThresholdEventArgs) -> MonitorResult<Vec<String>> {
        Self::process_event(self, &args.event, args.threshold_ids.as_deref())
    }
}

impl BackupTarget for ThresholdService {
    fn name(&self) -> &'static str {
        "thresholds"
    }

    fn dirty_queue(&self) -> &DirtyQueue {
        &self.dirty
    }

    fn persist_key(&self, key: &str) -> MonitorResult<()> {
        let tid = TenantId::parse(key).ok_or_else(|| MonitorError::internal(format!("malformed dirty key {key}")))?;
        // Under the guard: an instance removed first stays removed.
        self.guard(&tid.tenant, &tid.id, || {
            let Some(shared) = self.dm.cached_instance::<Threshold>(&tid.tenant, &tid.id) else {
                return Ok(());
            };
            let res = persist_instance(&self.dm, &mut *lock_instance(&shared));
            res
        })
    }
}

impl Drop for ThresholdService {
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
    use crate::storage::InMemoryDb;

    #[derive(Default)]
    struct Recorder {
        runs: Mutex<Vec<(String, Vec<String>)>>,
        fail: bool,
    }

    impl ActionExecutor for Recorder {
        fn execute(&self, tenant: &str, action_ids: &[String], _event: &CgrEvent) -> MonitorResult<()> {
            if self.fail {
                return Err(MonitorError::internal("action failed"));
            }
            self.runs
                .lock()
                .unwrap()
                .push((tenant.to_string(), action_ids.to_vec()));
            Ok(())
        }
    }

    fn service(actions: Arc<Recorder>) -> ThresholdService {
        let dm = Arc::new(DataManager::new(Arc::new(InMemoryDb::new()), Arc::new(Cache::new())));
        let filters = Arc::new(FilterService::new(Arc::clone(&dm), false));
        let cfg = ThresholdsConfig {
            enabled: true,
            store_interval: StoreInterval::Synchronous,
            ..ThresholdsConfig::default()
        };
        ThresholdService::new(dm, filters, Arc::new(Guardian::new()), cfg, Duration::ZERO, actions)
    }

    fn profile(id: &str) -> ThresholdProfile {
        let mut p = ThresholdProfile::new("cgrates.org", id);
        p.filter_ids = vec!["*string:~Account:1001".to_string()];
        p.action_ids = vec!["ACT_LOG".to_string()];
        p.stored = true;
        p
    }

    fn event(id: &str) -> CgrEvent {
        CgrEvent::new("cgrates.org", id).with_field("Account", "1001")
    }

    #[test]
    fn test_hits_run_actions_and_persist() {
        let actions = Arc::new(Recorder::default());
        let svc = service(Arc::clone(&actions));
        svc.set_threshold_profile(profile("TH1")).unwrap();

        assert_eq!(svc.process_event(&event("e1"), None).unwrap(), vec!["TH1"]);
        assert_eq!(actions.runs.lock().unwrap().len(), 1);
        let th = svc.get_threshold(&TenantId::new("cgrates.org", "TH1")).unwrap();
        assert_eq!(th.hits, 1);
        assert_eq!(svc.get_threshold_ids("cgrates.org").unwrap(), vec!["TH1"]);
    }

    #[test]
    fn test_max_hits_removes_threshold() {
        let svc = service(Arc::new(Recorder::default()));
        let mut p = profile("TH_ONCE");
        p.max_hits = 1;
        svc.set_threshold_profile(p).unwrap();

        svc.process_event(&event("e1"), None).unwrap();
        let tid = TenantId::new("cgrates.org", "TH_ONCE");
        assert!(svc.get_threshold(&tid).unwrap_err().is_not_found());
        assert!(svc.process_event(&event("e2"), None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_spent_blocker_no_longer_hides_lighter_thresholds() {
        let svc = service(Arc::new(Recorder::default()));
        let mut once = profile("TH_ONCE");
        once.max_hits = 1;
        once.blocker = true;
        once.weight = 20.0;
        svc.set_threshold_profile(once).unwrap();
        let mut low = profile("TH_LOW");
        low.filter_ids.clear();
        low.weight = 10.0;
        svc.set_threshold_profile(low).unwrap();

        assert_eq!(svc.process_event(&event("e1"), None).unwrap(), vec!["TH_ONCE"]);
        assert_eq!(svc.get_thresholds_for_event(&event("e2"), None).unwrap(), vec!["TH_LOW"]);
        assert_eq!(svc.process_event(&event("e2"), None).unwrap(), vec!["TH_LOW"]);
        assert_eq!(svc.get_threshold(&TenantId::new("cgrates.org", "TH_LOW")).unwrap().hits, 1);
    }

    #[test]
    fn test_snooze_and_reset() {
        let actions = Arc::new(Recorder::default());
        let svc = service(Arc::clone(&actions));
        let mut p = profile("TH1");
        p.min_sleep = Duration::from_secs(3600);
        svc.set_threshold_profile(p).unwrap();

        svc.process_event(&event("e1"), None).unwrap();
        svc.process_event(&event("e2"), None).unwrap();
        assert_eq!(actions.runs.lock().unwrap().len(), 1);

        let tid = TenantId::new("cgrates.org", "TH1");
        assert_eq!(svc.get_threshold(&tid).unwrap().hits, 2);
        svc.reset_threshold(&tid).unwrap();
        let th = svc.get_threshold(&tid).unwrap();
        assert_eq!(th.hits, 0);
        assert!(th.snooze.is_none());

        svc.process_event(&event("e3"), None).unwrap();
        assert_eq!(actions.runs.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_action_failure_is_partial() {
        let svc = service(Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        }));
        svc.set_threshold_profile(profile("TH1")).unwrap();
        let err = svc.process_event(&event("e1"), None).unwrap_err();
        assert!(err.is_partially_executed());
        // The hit still counted.
        assert_eq!(svc.get_threshold(&TenantId::new("cgrates.org", "TH1")).unwrap().hits, 1);
    }

    #[test]
    fn test_processor_trait_uses_explicit_ids() {
        let svc = service(Arc::new(Recorder::default()));
        svc.set_threshold_profile(profile("TH1")).unwrap();
        let mut other = profile("TH2");
        other.filter_ids.clear();
        svc.set_threshold_profile(other).unwrap();

        let args = ThresholdEventArgs {
            threshold_ids: Some(vec!["TH2".to_string()]),
            event: event("e1"),
        };
        assert_eq!(ThresholdProcessor::process_event(&svc, args).unwrap(), vec!["TH2"]);
    }
}
