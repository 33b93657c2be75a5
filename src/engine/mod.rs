//! The generic matching and tracking engine shared by stats, resources and
//! thresholds.
//!
//! Each service follows the same cycle per event:
//!
//! ```text
//! candidates (index | explicit ids)
//!   → profile fetch → activation check → filter predicate
//!   → weight sort + blocker cut
//!   → guarded mutate of each instance
//!   → dirty tracking (persist now | enqueue for backup | nothing)
//!   → cascade into thresholds
//! ```
//!
//! This module holds the pieces that do not depend on the domain.

pub mod backup;
pub mod dirty;

use std::cmp::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{de::DeserializeOwned, Serialize};

use crate::cache::{Cache, CachePartition, SharedInstance};
use crate::config::{IndexingOpts, StoreInterval};
use crate::error::{MonitorError, MonitorResult, ValidationError};
use crate::event::CgrEvent;
use crate::filters::FilterPredicate;
use crate::storage::keys::ItemKind;
use crate::storage::DataManager;
use crate::time::ActivationInterval;

pub use backup::{BackupScheduler, BackupTarget, DrainStats};
pub use dirty::DirtyQueue;

/// Persistence tracking for an instance. Never serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DirtyState {
    /// The profile is not `stored`; changes are never written.
    #[default]
    Untracked,
    /// Stored and in sync with the database.
    Clean,
    /// Changed since the last successful write.
    Dirty,
}

/// What to do after an instance changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {
    Skip,
    PersistNow,
    Enqueue,
}

/// Common profile surface.
pub trait MonitorProfile: Send + Sync {
    fn tenant(&self) -> &str;
    fn id(&self) -> &str;
    fn filter_ids(&self) -> &[String];
    fn activation_interval(&self) -> Option<&ActivationInterval>;
    fn weight(&self) -> f64;
    fn blocker(&self) -> bool;
    fn stored(&self) -> bool;

    /// Domain checks run before the profile is written.
    ///
    /// # Errors
    ///
    /// `InvalidProfile` describing the problem.
    fn validate(&self) -> Result<(), ValidationError> {
        if self.tenant().is_empty() || self.id().is_empty() {
            return Err(ValidationError::InvalidProfile {
                tenant_id: format!("{}:{}", self.tenant(), self.id()),
                reason: "tenant and id are required".to_string(),
            });
        }
        Ok(())
    }
}

/// A profile type the data manager can store and cache.
pub trait ProfileRecord: MonitorProfile + Serialize + DeserializeOwned + 'static {
    const KIND: ItemKind;
    fn partition(cache: &Cache) -> &CachePartition<Arc<Self>>;
}

/// Common instance surface.
pub trait MonitorInstance: Send {
    fn tenant(&self) -> &str;
    fn id(&self) -> &str;
    fn dirty_state(&self) -> DirtyState;
    fn set_dirty_state(&mut self, state: DirtyState);

    /// `tenant:id`, the key used by the dirty queue.
    fn tenant_id(&self) -> String {
        format!("{}:{}", self.tenant(), self.id())
    }
}

/// An instance type the data manager can store and cache.
pub trait InstanceRecord: MonitorInstance + Serialize + DeserializeOwned + 'static {
    const PREFIX: &'static str;
    fn partition(cache: &Cache) -> &CachePartition<SharedInstance<Self>>;
}

/// Locks an instance, recovering from poisoning.
///
/// A panic mid-mutation leaves the instance as the panicking thread left it;
/// the next writer carries on from there.
pub fn lock_instance<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Moves a freshly loaded or created instance into tracking when its profile
/// is stored.
pub fn track<I: MonitorInstance>(instance: &mut I, stored: bool) {
    if stored && instance.dirty_state() == DirtyState::Untracked {
        instance.set_dirty_state(DirtyState::Clean);
    }
}

/// Records a mutation and returns the persistence action for it.
pub fn mark_changed<I: MonitorInstance>(instance: &mut I, interval: StoreInterval) -> StoreAction {
    if interval == StoreInterval::Never || instance.dirty_state() == DirtyState::Untracked {
        return StoreAction::Skip;
    }
    instance.set_dirty_state(DirtyState::Dirty);
    match interval {
        StoreInterval::Synchronous => StoreAction::PersistNow,
        _ => StoreAction::Enqueue,
    }
}

/// Writes a dirty instance and marks it clean.
///
/// # Errors
///
/// Storage failures; the instance stays dirty.
pub fn persist_instance<I: InstanceRecord>(dm: &DataManager, instance: &mut I) -> MonitorResult<()> {
    if instance.dirty_state() != DirtyState::Dirty {
        return Ok(());
    }
    dm.set_instance(instance)?;
    instance.set_dirty_state(DirtyState::Clean);
    Ok(())
}

/// Runs the [`StoreAction`] for a changed instance.
///
/// # Errors
///
/// Storage failures on synchronous persistence.
pub fn apply_store_action<I: InstanceRecord>(
    dm: &DataManager,
    dirty: &DirtyQueue,
    instance: &mut I,
    action: StoreAction,
) -> MonitorResult<()> {
    match action {
        StoreAction::Skip => Ok(()),
        StoreAction::PersistNow => persist_instance(dm, instance),
        StoreAction::Enqueue => {
            dirty.push(instance.tenant_id());
            Ok(())
        }
    }
}

/// Stable sort by descending weight.
pub fn sort_by_weight<P: MonitorProfile>(profiles: &mut [Arc<P>]) {
    profiles.sort_by(|a, b| b.weight().partial_cmp(&a.weight()).unwrap_or(Ordering::Equal));
}

/// Drops everything after the first blocker. Expects a weight-sorted list:
/// a blocker only hides lighter profiles, heavier ones stay ahead of it.
pub fn truncate_after_blocker<P: MonitorProfile>(profiles: &mut Vec<Arc<P>>) {
    if let Some(pos) = profiles.iter().position(|p| p.blocker()) {
        profiles.truncate(pos + 1);
    }
}

/// What a service needs to select profiles.
pub struct MatchContext<'a> {
    pub dm: &'a DataManager,
    pub filters: &'a dyn FilterPredicate,
    pub opts: &'a IndexingOpts,
}

impl MatchContext<'_> {
    /// Profiles applying to `event`, weight-ordered and cut after the first
    /// blocker.
    ///
    /// # Errors
    ///
    /// `NotFound` when nothing matches; filter or storage errors abort.
    pub fn match_profiles<P: ProfileRecord>(
        &self,
        event: &CgrEvent,
        explicit_ids: Option<&[String]>,
    ) -> MonitorResult<Vec<Arc<P>>> {
        self.match_profiles_with(event, explicit_ids, |_| Ok(true))
    }

    /// Like [`Self::match_profiles`], with `keep` deciding for every
    /// filter-passing candidate before the sort and the blocker cut.
    ///
    /// # Errors
    ///
    /// `NotFound` when nothing is kept; errors from `keep` abort.
    pub fn match_profiles_with<P: ProfileRecord>(
        &self,
        event: &CgrEvent,
        explicit_ids: Option<&[String]>,
        mut keep: impl FnMut(&P) -> MonitorResult<bool>,
    ) -> MonitorResult<Vec<Arc<P>>> {
        let ids: Vec<String> = match explicit_ids {
            Some(ids) if !ids.is_empty() => ids.to_vec(),
            _ => self
                .dm
                .indexer()
                .matching_item_ids_for_event(event, self.opts, P::KIND, &event.tenant)?
                .into_iter()
                .collect(),
        };

        let at = event.effective_time();
        let mut matched = Vec::with_capacity(ids.len());
        for id in &ids {
            let profile = match self.dm.get_profile::<P>(&event.tenant, id, true, true) {
                Ok(p) => p,
                Err(MonitorError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            if profile.activation_interval().is_some_and(|ai| !ai.is_active_at(at)) {
                continue;
            }
            if !self.filters.pass(&event.tenant, profile.filter_ids(), event)? {
                continue;
            }
            if !keep(&*profile)? {
                continue;
            }
            matched.push(profile);
        }

        sort_by_weight(&mut matched);
        truncate_after_blocker(&mut matched);
        if matched.is_empty() {
            return Err(MonitorError::NotFound);
        }
        Ok(matched)
    }
}

/// Cached instance for `profile`, creating it when none exists.
///
/// # Errors
///
/// Storage failures other than `NotFound`.
pub fn instance_for<P, I>(
    dm: &DataManager,
    profile: &P,
    create: impl FnOnce(&P) -> I,
) -> MonitorResult<SharedInstance<I>>
where
    P: MonitorProfile,
    I: InstanceRecord,
{
    match dm.get_instance::<I>(profile.tenant(), profile.id(), true, true) {
        Ok(instance) => Ok(instance),
        Err(MonitorError::NotFound) => Ok(dm.cache_instance(create(profile))),
        Err(e) => Err(e),
    }
}

/// Folds per-instance failures into the service result.
///
/// # Errors
///
/// `PartiallyExecuted` with every processed id when anything failed.
pub fn finish(ids: Vec<String>, failed: usize) -> MonitorResult<Vec<String>> {
    if failed > 0 {
        return Err(MonitorError::PartiallyExecuted { ids });
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{StatQueue, StatQueueProfile};

    fn weighted(id: &str, weight: f64, blocker: bool) -> Arc<StatQueueProfile> {
        let mut p = StatQueueProfile::new("t", id);
        p.weight = weight;
        p.blocker = blocker;
        Arc::new(p)
    }

    fn ids(v: &[Arc<StatQueueProfile>]) -> Vec<&str> {
        v.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn test_sort_is_stable_and_descending() {
        let mut v = vec![
            weighted("a", 10.0, false),
            weighted("b", 20.0, false),
            weighted("c", 10.0, false),
        ];
        sort_by_weight(&mut v);
        assert_eq!(ids(&v), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_blocker_cuts_lower_weights() {
        let mut v = vec![weighted("low", 10.0, false), weighted("high", 20.0, true)];
        sort_by_weight(&mut v);
        truncate_after_blocker(&mut v);
        assert_eq!(ids(&v), vec!["high"]);

        let mut v = vec![weighted("low", 10.0, true), weighted("high", 20.0, false)];
        sort_by_weight(&mut v);
        truncate_after_blocker(&mut v);
        assert_eq!(ids(&v), vec!["high", "low"]);
    }

    #[test]
    fn test_mark_changed_per_interval() {
        let profile = StatQueueProfile::new("t", "SQ");
        let mut sq = StatQueue::new(&profile);
        assert_eq!(mark_changed(&mut sq, StoreInterval::Synchronous), StoreAction::Skip);

        track(&mut sq, true);
        assert_eq!(sq.dirty_state(), DirtyState::Clean);
        assert_eq!(mark_changed(&mut sq, StoreInterval::Never), StoreAction::Skip);
        assert_eq!(sq.dirty_state(), DirtyState::Clean);

        assert_eq!(mark_changed(&mut sq, StoreInterval::Synchronous), StoreAction::PersistNow);
        assert_eq!(sq.dirty_state(), DirtyState::Dirty);
        assert_eq!(
            mark_changed(&mut sq, StoreInterval::Every(std::time::Duration::from_secs(1))),
            StoreAction::Enqueue
        );
    }

    #[test]
    fn test_finish_reports_partial() {
        assert_eq!(finish(vec!["a".into()], 0).unwrap(), vec!["a"]);
        assert!(finish(vec!["a".into()], 1).unwrap_err().is_partially_executed());
    }
}
