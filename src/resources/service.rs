//! The resources service.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cache::SharedInstance;
use crate::config::ResourcesConfig;
use crate::engine::{
    apply_store_action, backup, instance_for, lock_instance, mark_changed, persist_instance, track,
    BackupScheduler, BackupTarget, DirtyQueue, MatchContext,
};
use crate::error::{MonitorError, MonitorResult};
use crate::event::{concat_key, fields, CgrEvent, TenantId};
use crate::filters::FilterPredicate;
use crate::guardian::Guardian;
use crate::storage::keys::RESOURCE_PREFIX;
use crate::storage::DataManager;
use crate::thresholds::{ThresholdEventArgs, ThresholdProcessor};
use crate::time::to_chrono;

use super::resource::{Resource, ResourceProfile, ResourceUsage};
use super::ResourceArgs;

type Matched = Vec<(Arc<ResourceProfile>, SharedInstance<Resource>)>;

/// Grants and releases units on resources.
pub struct ResourceService {
    dm: Arc<DataManager>,
    filters: Arc<dyn FilterPredicate>,
    guardian: Arc<Guardian>,
    cfg: ResourcesConfig,
    locking_timeout: Duration,
    dirty: DirtyQueue,
    thresholds: Option<Arc<dyn ThresholdProcessor>>,
    backup: Mutex<Option<BackupScheduler>>,
}

impl ResourceService {
    #[must_use]
    pub fn new(
        dm: Arc<DataManager>,
        filters: Arc<dyn FilterPredicate>,
        guardian: Arc<Guardian>,
        cfg: ResourcesConfig,
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

    /// Enables the cascade of usage updates into thresholds.
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
        tracing::info!(?interval, "resources backup started");
        Ok(())
    }

    /// Stops the backup thread and writes whatever is still dirty.
    pub fn shutdown(&self) {
        if let Some(mut scheduler) = self.backup.lock().unwrap_or_else(PoisonError::into_inner).take() {
            scheduler.stop();
        }
        let stats = backup::drain(self);
        tracing::info!(stored = stats.stored, failed = stats.failed, "resources service stopped");
    }

    #[must_use]
    pub const fn dirty_queue(&self) -> &DirtyQueue {
        &self.dirty
    }

    fn matcher(&self) -> MatchContext<'_> {
        MatchContext {
            dm: &self.dm,
            filters: self.filters.as_ref(),
            opts: &self.cfg.indexing,
        }
    }

    fn guard<T>(&self, tenant: &str, ids: &[&str], f: impl FnOnce() -> T) -> T {
        self.guardian
            .guard_ids(self.locking_timeout, RESOURCE_PREFIX, tenant, ids, f)
    }

    fn usage_key(args: &ResourceArgs) -> String {
        concat_key(&[args.event.tenant.as_str(), args.usage_id.as_str()])
    }

    /// Profiles an allocation applies to. A usage id seen before resolves to
    /// the resources that took it, so later calls hit the same set.
    fn resolve(&self, args: &ResourceArgs) -> MonitorResult<Vec<Arc<ResourceProfile>>> {
        if let Some(Some(ids)) = self.dm.cache().event_resources.get(&Self::usage_key(args)) {
            let mut profiles = Vec::with_capacity(ids.len());
            for id in ids.iter() {
                match self.dm.get_resource_profile(&args.event.tenant, id) {
                    Ok(p) => profiles.push(p),
                    Err(MonitorError::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            if !profiles.is_empty() {
                return Ok(profiles);
            }
        }
        self.matcher().match_profiles::<ResourceProfile>(&args.event, None)
    }

    /// Runs `f` over the instances of `profiles` with all of them guarded and
    /// expired usages already dropped.
    fn with_resources<T>(
        &self,
        profiles: &[Arc<ResourceProfile>],
        f: impl FnOnce(&Matched) -> MonitorResult<T>,
    ) -> MonitorResult<T> {
        let Some(first) = profiles.first() else {
            return Err(MonitorError::NotFound);
        };
        let ids: Vec<&str> = profiles.iter().map(|p| p.id.as_str()).collect();
        self.guard(&first.tenant, &ids, || {
            let now = Utc::now();
            let mut matched = Vec::with_capacity(profiles.len());
            for profile in profiles {
                let shared = instance_for(&self.dm, profile.as_ref(), Resource::new)?;
                {
                    let mut r = lock_instance(&shared);
                    track(&mut *r, profile.stored);
                    r.set_ttl(profile.usage_ttl);
                    self.purge_expired(&mut r, now);
                }
                matched.push((Arc::clone(profile), shared));
            }
            f(&matched)
        })
    }

    /// Drops expired usages, stores the resource if any went and unlinks
    /// them from the usage lookup. Callers hold the resource's guard.
    fn purge_expired(&self, r: &mut Resource, now: DateTime<Utc>) {
        let expired = r.remove_expired(now);
        if expired.is_empty() {
            return;
        }
        self.store(r);
        for usage_id in &expired {
            let key = concat_key(&[r.tenant.as_str(), usage_id.as_str()]);
            self.dm.cache().event_resources.update(&key, |ids| {
                let ids: Vec<String> = ids?.iter().filter(|id| **id != r.id).cloned().collect();
                (!ids.is_empty()).then(|| Arc::new(ids))
            });
        }
        tracing::debug!(tenant = %r.tenant, resource = %r.id, expired = expired.len(), "expired usages dropped");
    }

    /// Persistence failures here are logged, the allocation already stands.
    fn store(&self, r: &mut Resource) {
        let action = mark_changed(r, self.cfg.store_interval);
        if let Err(e) = apply_store_action(&self.dm, &self.dirty, r, action) {
            tracing::warn!(tenant = %r.tenant, resource = %r.id, error = %e, "resource not stored");
        }
    }

    fn validate(args: &ResourceArgs) -> MonitorResult<()> {
        let missing = args.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MonitorError::mandatory_missing(missing))
        }
    }

    /// Checks whether `args.units` would be granted. Nothing is recorded.
    ///
    /// # Errors
    ///
    /// `MandatoryIeMissing`, `NotFound` when no resource matches,
    /// `ResourceUnavailable` when none has room.
    pub fn authorize(&self, args: &ResourceArgs) -> MonitorResult<String> {
        self.allocate_inner(args, true)
    }

    /// Records `args.units` on every matched resource.
    ///
    /// Returns the allocation message of the first resource with room.
    ///
    /// # Errors
    ///
    /// As [`Self::authorize`].
    pub fn allocate(&self, args: &ResourceArgs) -> MonitorResult<String> {
        self.allocate_inner(args, false)
    }

    fn allocate_inner(&self, args: &ResourceArgs, dry_run: bool) -> MonitorResult<String> {
        Self::validate(args)?;
        let profiles = self.resolve(args)?;

        let (reply, updates) = self.with_resources(&profiles, |matched| {
            let mut reply = None;
            for (profile, shared) in matched {
                if lock_instance(shared).has_room_for(profile.limit, &args.usage_id, args.units) {
                    reply = Some(profile.allocation_reply());
                    break;
                }
            }
            let Some(reply) = reply else {
                return Err(MonitorError::ResourceUnavailable);
            };
            if dry_run {
                return Ok((reply, Vec::new()));
            }

            let now = Utc::now();
            let mut updates = Vec::with_capacity(matched.len());
            for (profile, shared) in matched {
                let mut r = lock_instance(shared);
                let expiry_time = r.ttl().map(|ttl| now + to_chrono(ttl));
                r.record_usage(ResourceUsage {
                    tenant: args.event.tenant.clone(),
                    id: args.usage_id.clone(),
                    expiry_time,
                    units: args.units,
                });
                self.store(&mut r);
                updates.push((Arc::clone(profile), r.total_usage()));
            }
            let ids: Vec<String> = matched.iter().map(|(p, _)| p.id.clone()).collect();
            self.dm
                .cache()
                .event_resources
                .set(Self::usage_key(args), Some(Arc::new(ids)));
            Ok((reply, updates))
        })?;

        for (profile, usage) in updates {
            self.cascade(&profile, usage);
        }
        tracing::debug!(tenant = %args.event.tenant, usage = %args.usage_id, dry_run, "resources allocated");
        Ok(reply)
    }

    /// Gives back a usage on every resource holding it.
    ///
    /// # Errors
    ///
    /// `MandatoryIeMissing`, or `NotFound` when no matched resource held the
    /// usage.
    pub fn release(&self, args: &ResourceArgs) -> MonitorResult<()> {
        Self::validate(args)?;
        let profiles = self.resolve(args)?;

        let updates = self.with_resources(&profiles, |matched| {
            let mut updates = Vec::new();
            for (profile, shared) in matched {
                let mut r = lock_instance(shared);
                if r.clear_usage(&args.usage_id).is_err() {
                    continue;
                }
                self.store(&mut r);
                updates.push((Arc::clone(profile), r.total_usage()));
            }
            self.dm.cache().event_resources.remove(&Self::usage_key(args));
            if updates.is_empty() {
                return Err(MonitorError::NotFound);
            }
            Ok(updates)
        })?;

        for (profile, usage) in updates {
            self.cascade(&profile, usage);
        }
        Ok(())
    }

    /// Tells thresholds about a resource's new usage. Failures are logged
    /// only; the allocation is not undone.
    fn cascade(&self, profile: &ResourceProfile, usage: f64) {
        let Some(thresholds) = &self.thresholds else {
            return;
        };
        let Some(threshold_ids) = profile.cascade_ids() else {
            return;
        };
        let event = CgrEvent::new(profile.tenant.clone(), Uuid::new_v4().to_string())
            .with_field(fields::EVENT_TYPE, fields::RESOURCE_UPDATE)
            .with_field(fields::RESOURCE_ID, profile.id.clone())
            .with_field(fields::USAGE, usage);
        let args = ThresholdEventArgs {
            threshold_ids: (!threshold_ids.is_empty()).then(|| threshold_ids.to_vec()),
            event,
        };
        match thresholds.process_event(args) {
            Ok(_) | Err(MonitorError::NotFound) => {}
            Err(e) => {
                tracing::warn!(tenant = %profile.tenant, resource = %profile.id, error = %e, "resource cascade failed");
            }
        }
    }

    /// Snapshots of the resources an allocation would touch.
    ///
    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn get_resources_for_event(&self, args: &ResourceArgs) -> MonitorResult<Vec<Resource>> {
        Self::validate(args)?;
        let profiles = self.resolve(args)?;
        self.with_resources(&profiles, |matched| {
            Ok(matched.iter().map(|(_, shared)| lock_instance(shared).clone()).collect())
        })
    }

    /// Snapshot of one resource.
    ///
    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn get_resource(&self, tid: &TenantId) -> MonitorResult<Resource> {
        let missing = tid.missing_fields();
        if !missing.is_empty() {
            return Err(MonitorError::mandatory_missing(missing));
        }
        self.guard(&tid.tenant, &[tid.id.as_str()], || {
            let shared = self.dm.get_instance::<Resource>(&tid.tenant, &tid.id, true, true)?;
            let mut r = lock_instance(&shared);
            self.purge_expired(&mut r, Utc::now());
            let snapshot = r.clone();
            Ok(snapshot)
        })
    }

    /// Ids of the tenant's persisted resources.
    ///
    /// # Errors
    ///
    /// `NotFound` when there are none.
    pub fn get_resource_ids(&self, tenant: &str) -> MonitorResult<Vec<String>> {
        let ids = self.dm.instance_ids::<Resource>(tenant)?;
        if ids.is_empty() {
            return Err(MonitorError::NotFound);
        }
        Ok(ids)
    }

    /// Stores a profile and creates its resource when there is none yet.
    /// Usages already held survive a profile update.
    ///
    /// # Errors
    ///
    /// Validation, unknown filters or storage failures.
    pub fn set_resource_profile(&self, profile: ResourceProfile) -> MonitorResult<()> {
        let profile = self.dm.set_resource_profile(profile)?;
        self.guard(&profile.tenant, &[profile.id.as_str()], || {
            match self.dm.get_instance::<Resource>(&profile.tenant, &profile.id, true, true) {
                Ok(_) => return Ok(()),
                Err(MonitorError::NotFound) => {}
                Err(e) => return Err(e),
            }
            let mut r = Resource::new(&profile);
            track(&mut r, profile.stored);
            self.dm.set_instance(&r)?;
            self.dm.replace_instance(r);
            tracing::debug!(tenant = %profile.tenant, resource = %profile.id, "resource created");
            Ok(())
        })
    }

    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn get_resource_profile(&self, tid: &TenantId) -> MonitorResult<Arc<ResourceProfile>> {
        self.dm.get_resource_profile(&tid.tenant, &tid.id)
    }

    /// Deletes a profile together with its resource.
    ///
    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn remove_resource_profile(&self, tid: &TenantId) -> MonitorResult<()> {
        self.dm.remove_resource_profile(&tid.tenant, &tid.id)?;
        self.guard(&tid.tenant, &[tid.id.as_str()], || {
            self.dm.remove_instance::<Resource>(&tid.tenant, &tid.id)
        })?;
        self.dirty.remove(&tid.to_string());
        Ok(())
    }
}

impl BackupTarget for ResourceService {
    fn name(&self) -> &'static str {
        "resources"
    }

    fn dirty_queue(&self) -> &DirtyQueue {
        &self.dirty
    }

    fn persist_key(&self, key: &str) -> MonitorResult<()> {
        let tid = TenantId::parse(key).ok_or_else(|| MonitorError::internal(format!("malformed dirty key {key}")))?;
        // Under the guard: an instance removed first stays removed.
        self.guard(&tid.tenant, &[tid.id.as_str()], || {
            let Some(shared) = self.dm.cached_instance::<Resource>(&tid.tenant, &tid.id) else {
                return Ok(());
            };
            let res = persist_instance(&self.dm, &mut *lock_instance(&shared));
            res
        })
    }
}

impl Drop for ResourceService {
    fn drop(&mut self) {
        if let Some(mut scheduler) = self.backup.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            scheduler.stop();
        }
    }
}
