//! Per-domain API facades.
//!
//! Each facade is a thin, typed surface over one service. Errors leave
//! through [`MonitorError::into_rpc`] so storage details never reach a
//! caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, MonitorResult};
use crate::event::{CgrEvent, TenantId};
use crate::filters::Filter;
use crate::resources::{Resource, ResourceArgs, ResourceProfile, ResourceService};
use crate::stats::{StatQueue, StatQueueProfile, StatService};
use crate::storage::keys::ItemKind;
use crate::storage::DataManager;
use crate::thresholds::{Threshold, ThresholdEventArgs, ThresholdProfile, ThresholdService};

pub const PONG: &str = "Pong";
pub const OK: &str = "OK";

fn rpc<T>(result: MonitorResult<T>) -> MonitorResult<T> {
    result.map_err(MonitorError::into_rpc)
}

/// An event for stats, optionally restricted to explicit queue ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsEventArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat_ids: Option<Vec<String>>,
    #[serde(flatten)]
    pub event: CgrEvent,
}

/// A bare tenant, for id listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantArg {
    pub tenant: String,
}

impl TenantArg {
    fn checked(&self) -> MonitorResult<&str> {
        if self.tenant.is_empty() {
            return Err(MonitorError::mandatory_missing(["Tenant"]));
        }
        Ok(&self.tenant)
    }
}

/// Which index family to rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexFamily {
    Stats,
    Resources,
    Thresholds,
}

impl From<IndexFamily> for ItemKind {
    fn from(family: IndexFamily) -> Self {
        match family {
            IndexFamily::Stats => Self::StatQueueProfile,
            IndexFamily::Resources => Self::ResourceProfile,
            IndexFamily::Thresholds => Self::ThresholdProfile,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexArgs {
    pub family: IndexFamily,
    pub tenant: String,
}

/// `StatSv1`
#[derive(Clone)]
pub struct StatSv1 {
    stats: Arc<StatService>,
}

impl StatSv1 {
    #[must_use]
    pub const fn new(stats: Arc<StatService>) -> Self {
        Self { stats }
    }

    #[must_use]
    pub const fn ping(&self) -> &'static str {
        PONG
    }

    /// # Errors
    ///
    /// As [`StatService::process_event`].
    pub fn process_event(&self, args: &StatsEventArgs) -> MonitorResult<Vec<String>> {
        rpc(self.stats.process_event(&args.event, args.stat_ids.as_deref()))
    }

    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn get_stat_queues_for_event(&self, args: &StatsEventArgs) -> MonitorResult<Vec<String>> {
        rpc(self.stats.get_stat_queues_for_event(&args.event, args.stat_ids.as_deref()))
    }

    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn get_stat_queue(&self, tid: &TenantId) -> MonitorResult<StatQueue> {
        rpc(self.stats.get_stat_queue(tid))
    }

    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn get_queue_ids(&self, arg: &TenantArg) -> MonitorResult<Vec<String>> {
        rpc(arg.checked().and_then(|t| self.stats.get_queue_ids(t)))
    }

    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn get_queue_string_metrics(&self, tid: &TenantId) -> MonitorResult<BTreeMap<String, String>> {
        rpc(self.stats.get_queue_string_metrics(tid))
    }

    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn get_queue_float_metrics(&self, tid: &TenantId) -> MonitorResult<BTreeMap<String, f64>> {
        rpc(self.stats.get_queue_float_metrics(tid))
    }
}

/// `ResourceSv1`
#[derive(Clone)]
pub struct ResourceSv1 {
    resources: Arc<ResourceService>,
}

impl ResourceSv1 {
    #[must_use]
    pub const fn new(resources: Arc<ResourceService>) -> Self {
        Self { resources }
    }

    #[must_use]
    pub const fn ping(&self) -> &'static str {
        PONG
    }

    /// # Errors
    ///
    /// As [`ResourceService::authorize`].
    pub fn authorize_resources(&self, args: &ResourceArgs) -> MonitorResult<String> {
        rpc(self.resources.authorize(args))
    }

    /// # Errors
    ///
    /// As [`ResourceService::allocate`].
    pub fn allocate_resources(&self, args: &ResourceArgs) -> MonitorResult<String> {
        rpc(self.resources.allocate(args))
    }

    /// # Errors
    ///
    /// As [`ResourceService::release`].
    pub fn release_resources(&self, args: &ResourceArgs) -> MonitorResult<&'static str> {
        rpc(self.resources.release(args)).map(|()| OK)
    }

    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn get_resources_for_event(&self, args: &ResourceArgs) -> MonitorResult<Vec<Resource>> {
        rpc(self.resources.get_resources_for_event(args))
    }

    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn get_resource(&self, tid: &TenantId) -> MonitorResult<Resource> {
        rpc(self.resources.get_resource(tid))
    }

    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn get_resource_ids(&self, arg: &TenantArg) -> MonitorResult<Vec<String>> {
        rpc(arg.checked().and_then(|t| self.resources.get_resource_ids(t)))
    }
}

/// `ThresholdSv1`
#[derive(Clone)]
pub struct ThresholdSv1 {
    thresholds: Arc<ThresholdService>,
}

impl ThresholdSv1 {
    #[must_use]
    pub const fn new(thresholds: Arc<ThresholdService>) -> Self {
        Self { thresholds }
    }

    #[must_use]
    pub const fn ping(&self) -> &'static str {
        PONG
    }

    /// # Errors
    ///
    /// As [`ThresholdService::process_event`].
    pub fn process_event(&self, args: &ThresholdEventArgs) -> MonitorResult<Vec<String>> {
        rpc(self
            .thresholds
            .process_event(&args.event, args.threshold_ids.as_deref()))
    }

    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn get_thresholds_for_event(&self, args: &ThresholdEventArgs) -> MonitorResult<Vec<String>> {
        rpc(self
            .thresholds
            .get_thresholds_for_event(&args.event, args.threshold_ids.as_deref()))
    }

    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn get_threshold(&self, tid: &TenantId) -> MonitorResult<Threshold> {
        rpc(self.thresholds.get_threshold(tid))
    }

    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn get_threshold_ids(&self, arg: &TenantArg) -> MonitorResult<Vec<String>> {
        rpc(arg.checked().and_then(|t| self.thresholds.get_threshold_ids(t)))
    }

    /// # Errors
    ///
    /// `MandatoryIeMissing` or `NotFound`.
    pub fn reset_threshold(&self, tid: &TenantId) -> MonitorResult<&'static str> {
        rpc(self.thresholds.reset_threshold(tid)).map(|()| OK)
    }
}

/// `AdminSv1`: filters, profiles and index maintenance.
#[derive(Clone)]
pub struct AdminSv1 {
    dm: Arc<DataManager>,
    stats: Option<Arc<StatService>>,
    resources: Option<Arc<ResourceService>>,
    thresholds: Option<Arc<ThresholdService>>,
}

fn enabled<'a, T>(service: &'a Option<Arc<T>>, name: &str) -> MonitorResult<&'a T> {
    service.as_deref().ok_or_else(|| MonitorError::ServerError {
        message: format!("{name} service disabled"),
    })
}

fn checked_tid(tid: &TenantId) -> MonitorResult<&TenantId> {
    let missing = tid.missing_fields();
    if !missing.is_empty() {
        return Err(MonitorError::mandatory_missing(missing));
    }
    Ok(tid)
}

impl AdminSv1 {
    #[must_use]
    pub const fn new(
        dm: Arc<DataManager>,
        stats: Option<Arc<StatService>>,
        resources: Option<Arc<ResourceService>>,
        thresholds: Option<Arc<ThresholdService>>,
    ) -> Self {
        Self {
            dm,
            stats,
            resources,
            thresholds,
        }
    }

    #[must_use]
    pub const fn ping(&self) -> &'static str {
        PONG
    }

    /// # Errors
    ///
    /// Invalid rules or storage failures.
    pub fn set_filter(&self, filter: Filter) -> MonitorResult<&'static str> {
        rpc(self.dm.set_filter(filter)).map(|()| OK)
    }

    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn get_filter(&self, tid: &TenantId) -> MonitorResult<Filter> {
        rpc(checked_tid(tid).and_then(|tid| self.dm.get_filter(&tid.tenant, &tid.id, true, true)))
            .map(|f| f.as_ref().clone())
    }

    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn remove_filter(&self, tid: &TenantId) -> MonitorResult<&'static str> {
        rpc(checked_tid(tid).and_then(|tid| self.dm.remove_filter(&tid.tenant, &tid.id))).map(|()| OK)
    }

    /// # Errors
    ///
    /// Validation, unknown filters or storage failures.
    pub fn set_stat_queue_profile(&self, profile: StatQueueProfile) -> MonitorResult<&'static str> {
        rpc(enabled(&self.stats, "stats").and_then(|s| s.set_stat_queue_profile(profile))).map(|()| OK)
    }

    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn get_stat_queue_profile(&self, tid: &TenantId) -> MonitorResult<StatQueueProfile> {
        rpc(checked_tid(tid).and_then(|tid| self.dm.get_stat_queue_profile(&tid.tenant, &tid.id)))
            .map(|p| p.as_ref().clone())
    }

    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn remove_stat_queue_profile(&self, tid: &TenantId) -> MonitorResult<&'static str> {
        rpc(enabled(&self.stats, "stats")
            .and_then(|s| checked_tid(tid).and_then(|tid| s.remove_stat_queue_profile(tid))))
        .map(|()| OK)
    }

    /// # Errors
    ///
    /// Validation, unknown filters or storage failures.
    pub fn set_resource_profile(&self, profile: ResourceProfile) -> MonitorResult<&'static str> {
        rpc(enabled(&self.resources, "resources").and_then(|s| s.set_resource_profile(profile))).map(|()| OK)
    }

    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn get_resource_profile(&self, tid: &TenantId) -> MonitorResult<ResourceProfile> {
        rpc(checked_tid(tid).and_then(|tid| self.dm.get_resource_profile(&tid.tenant, &tid.id)))
            .map(|p| p.as_ref().clone())
    }

    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn remove_resource_profile(&self, tid: &TenantId) -> MonitorResult<&'static str> {
        rpc(enabled(&self.resources, "resources")
            .and_then(|s| checked_tid(tid).and_then(|tid| s.remove_resource_profile(tid))))
        .map(|()| OK)
    }

    /// # Errors
    ///
    /// Validation, unknown filters or storage failures.
    pub fn set_threshold_profile(&self, profile: ThresholdProfile) -> MonitorResult<&'static str> {
        rpc(enabled(&self.thresholds, "thresholds").and_then(|s| s.set_threshold_profile(profile))).map(|()| OK)
    }

    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn get_threshold_profile(&self, tid: &TenantId) -> MonitorResult<ThresholdProfile> {
        rpc(checked_tid(tid).and_then(|tid| self.dm.get_threshold_profile(&tid.tenant, &tid.id)))
            .map(|p| p.as_ref().clone())
    }

    /// # Errors
    ///
    /// `NotFound` or storage failures.
    pub fn remove_threshold_profile(&self, tid: &TenantId) -> MonitorResult<&'static str> {
        rpc(enabled(&self.thresholds, "thresholds")
            .and_then(|s| checked_tid(tid).and_then(|tid| s.remove_threshold_profile(tid))))
        .map(|()| OK)
    }

    /// Rebuilds one family's filter index from its stored profiles.
    ///
    /// # Errors
    ///
    /// Storage failures or a profile referencing a missing filter.
    pub fn reindex(&self, args: &ReindexArgs) -> MonitorResult<usize> {
        if args.tenant.is_empty() {
            return Err(MonitorError::mandatory_missing(["Tenant"]));
        }
        rpc(self.dm.indexer().reindex(args.family.into(), &args.tenant))
    }
}
