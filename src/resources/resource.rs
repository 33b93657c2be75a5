use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{Cache, CachePartition, SharedInstance};
use crate::engine::{DirtyState, InstanceRecord, MonitorInstance, MonitorProfile, ProfileRecord};
use crate::error::{MonitorError, MonitorResult, ValidationError};
use crate::stats::NO_THRESHOLDS;
use crate::storage::keys::{ItemKind, RESOURCE_PREFIX};
use crate::time::{serde_opt_duration, ActivationInterval};

/// Configuration of one resource pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceProfile {
    pub tenant: String,
    pub id: String,
    pub filter_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_interval: Option<ActivationInterval>,
    /// Usages expire this long after they were recorded.
    #[serde(with = "serde_opt_duration", skip_serializing_if = "Option::is_none")]
    pub usage_ttl: Option<Duration>,
    /// Units available; negative means unlimited.
    pub limit: f64,
    /// Returned on successful allocation instead of the resource id.
    pub allocation_message: String,
    pub blocker: bool,
    pub stored: bool,
    pub weight: f64,
    pub threshold_ids: Vec<String>,
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self {
            tenant: String::new(),
            id: String::new(),
            filter_ids: Vec::new(),
            activation_interval: None,
            usage_ttl: None,
            limit: -1.0,
            allocation_message: String::new(),
            blocker: false,
            stored: false,
            weight: 0.0,
            threshold_ids: Vec::new(),
        }
    }
}

impl ResourceProfile {
    #[must_use]
    pub fn new(tenant: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            id: id.into(),
            ..Self::default()
        }
    }

    /// What a successful allocation reports.
    #[must_use]
    pub fn allocation_reply(&self) -> String {
        if self.allocation_message.is_empty() {
            self.id.clone()
        } else {
            self.allocation_message.clone()
        }
    }

    /// Thresholds to notify; `None` when cascading is switched off.
    #[must_use]
    pub fn cascade_ids(&self) -> Option<&[String]> {
        if self.threshold_ids.len() == 1 && self.threshold_ids[0] == NO_THRESHOLDS {
            return None;
        }
        Some(&self.threshold_ids)
    }
}

impl MonitorProfile for ResourceProfile {
    fn tenant(&self) -> &str {
        &self.tenant
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn filter_ids(&self) -> &[String] {
        &self.filter_ids
    }

    fn activation_interval(&self) -> Option<&ActivationInterval> {
        self.activation_interval.as_ref()
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn blocker(&self) -> bool {
        self.blocker
    }

    fn stored(&self) -> bool {
        self.stored
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.tenant.is_empty() || self.id.is_empty() {
            return Err(ValidationError::InvalidProfile {
                tenant_id: format!("{}:{}", self.tenant, self.id),
                reason: "tenant and id are required".to_string(),
            });
        }
        if self.limit.is_nan() {
            return Err(ValidationError::InvalidProfile {
                tenant_id: format!("{}:{}", self.tenant, self.id),
                reason: "limit is not a number".to_string(),
            });
        }
        Ok(())
    }
}

impl ProfileRecord for ResourceProfile {
    const KIND: ItemKind = ItemKind::ResourceProfile;

    fn partition(cache: &Cache) -> &CachePartition<Arc<Self>> {
        &cache.resource_profiles
    }
}

/// Units held by one usage id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub tenant: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_time: Option<DateTime<Utc>>,
    pub units: f64,
}

impl ResourceUsage {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_time.is_some_and(|e| e <= now)
    }
}

/// Live state of a resource: the usages currently held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub tenant: String,
    pub id: String,
    #[serde(default)]
    pub usages: BTreeMap<String, ResourceUsage>,
    /// Usage ids with an expiry, soonest first.
    #[serde(default)]
    pub ttl_idx: Vec<String>,
    #[serde(skip)]
    ttl: Option<Duration>,
    #[serde(skip)]
    total_usage: Option<f64>,
    #[serde(skip)]
    dirty: DirtyState,
}

impl Resource {
    #[must_use]
    pub fn new(profile: &ResourceProfile) -> Self {
        Self {
            tenant: profile.tenant.clone(),
            id: profile.id.clone(),
            usages: BTreeMap::new(),
            ttl_idx: Vec::new(),
            ttl: profile.usage_ttl,
            total_usage: None,
            dirty: DirtyState::Untracked,
        }
    }

    pub fn set_ttl(&mut self, ttl: Option<Duration>) {
        self.ttl = ttl;
    }

    #[must_use]
    pub const fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Drops usages expired at `now`, walking the TTL index from the front.
    /// Returns the ids dropped.
    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut removed = Vec::new();
        while let Some(first) = self.ttl_idx.first() {
            let expired = self.usages.get(first).map_or(true, |u| u.is_expired(now));
            if !expired {
                break;
            }
            let id = self.ttl_idx.remove(0);
            self.usages.remove(&id);
            removed.push(id);
        }
        if !removed.is_empty() {
            self.total_usage = None;
        }
        removed
    }

    /// Sum of units held. Cached until the usages change.
    pub fn total_usage(&mut self) -> f64 {
        *self
            .total_usage
            .get_or_insert_with(|| self.usages.values().map(|u| u.units).sum())
    }

    /// Whether `units` more fit under `limit`.
    pub fn has_room(&mut self, limit: f64, units: f64) -> bool {
        limit < 0.0 || limit >= self.total_usage() + units
    }

    /// As [`Self::has_room`], with `usage_id`'s current units given back
    /// first since recording it again replaces them.
    pub fn has_room_for(&mut self, limit: f64, usage_id: &str, units: f64) -> bool {
        let held = self.usages.get(usage_id).map_or(0.0, |u| u.units);
        limit < 0.0 || limit >= self.total_usage() - held + units
    }

    /// Adds a usage, replacing one with the same id.
    pub fn record_usage(&mut self, usage: ResourceUsage) {
        self.remove_usage(&usage.id);
        if let Some(expiry) = usage.expiry_time {
            let pos = self
                .ttl_idx
                .iter()
                .position(|id| self.usages.get(id).and_then(|u| u.expiry_time).is_some_and(|e| e > expiry))
                .unwrap_or(self.ttl_idx.len());
            self.ttl_idx.insert(pos, usage.id.clone());
        }
        self.usages.insert(usage.id.clone(), usage);
        self.total_usage = None;
    }

    fn remove_usage(&mut self, usage_id: &str) -> bool {
        if self.usages.remove(usage_id).is_none() {
            return false;
        }
        self.ttl_idx.retain(|id| id != usage_id);
        self.total_usage = None;
        true
    }

    /// # Errors
    ///
    /// `NotFound` when the usage is not held here.
    pub fn clear_usage(&mut self, usage_id: &str) -> MonitorResult<()> {
        if self.remove_usage(usage_id) {
            Ok(())
        } else {
            Err(MonitorError::NotFound)
        }
    }
}

impl MonitorInstance for Resource {
    fn tenant(&self) -> &str {
        &self.tenant
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn dirty_state(&self) -> DirtyState {
        self.dirty
    }

    fn set_dirty_state(&mut self, state: DirtyState) {
        self.dirty = state;
    }
}

impl InstanceRecord for Resource {
    const PREFIX: &'static str = RESOURCE_PREFIX;

    fn partition(cache: &Cache) -> &CachePartition<SharedInstance<Self>> {
        &cache.resources
    }
}
