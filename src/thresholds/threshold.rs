use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{Cache, CachePartition, SharedInstance};
use crate::engine::{DirtyState, InstanceRecord, MonitorInstance, MonitorProfile, ProfileRecord};
use crate::error::ValidationError;
use crate::storage::keys::{ItemKind, THRESHOLD_PREFIX};
use crate::time::{serde_duration, to_chrono, ActivationInterval};

/// Configuration of one threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdProfile {
    pub tenant: String,
    pub id: String,
    pub filter_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_interval: Option<ActivationInterval>,
    /// Hits after which the threshold is removed; -1 never removes it.
    pub max_hits: i64,
    /// Actions run only from this many hits on.
    pub min_hits: i64,
    /// Quiet period after actions ran.
    #[serde(with = "serde_duration")]
    pub min_sleep: Duration,
    pub blocker: bool,
    pub weight: f64,
    pub action_ids: Vec<String>,
    /// Run actions on a background thread.
    pub async_actions: bool,
    pub stored: bool,
}

impl Default for ThresholdProfile {
    fn default() -> Self {
        Self {
            tenant: String::new(),
            id: String::new(),
            filter_ids: Vec::new(),
            activation_interval: None,
            max_hits: -1,
            min_hits: 0,
            min_sleep: Duration::ZERO,
            blocker: false,
            weight: 0.0,
            action_ids: Vec::new(),
            async_actions: false,
            stored: false,
        }
    }
}

impl ThresholdProfile {
    #[must_use]
    pub fn new(tenant: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            id: id.into(),
            ..Self::default()
        }
    }
}

impl MonitorProfile for ThresholdProfile {
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
        let invalid = |reason: &str| ValidationError::InvalidProfile {
            tenant_id: format!("{}:{}", self.tenant, self.id),
            reason: reason.to_string(),
        };
        if self.tenant.is_empty() || self.id.is_empty() {
            return Err(invalid("tenant and id are required"));
        }
        if self.max_hits < -1 || self.max_hits == 0 {
            return Err(invalid("max_hits must be -1 or positive"));
        }
        if self.min_hits < 0 {
            return Err(invalid("min_hits must not be negative"));
        }
        Ok(())
    }
}

impl ProfileRecord for ThresholdProfile {
    const KIND: ItemKind = ItemKind::ThresholdProfile;

    fn partition(cache: &Cache) -> &CachePartition<Arc<Self>> {
        &cache.threshold_profiles
    }
}

/// Live state of a threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub tenant: String,
    pub id: String,
    #[serde(default)]
    pub hits: i64,
    /// Actions are held back until this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snooze: Option<DateTime<Utc>>,
    #[serde(skip)]
    dirty: DirtyState,
}

impl Threshold {
    #[must_use]
    pub fn new(profile: &ThresholdProfile) -> Self {
        Self {
            tenant: profile.tenant.clone(),
            id: profile.id.clone(),
            hits: 0,
            snooze: None,
            dirty: DirtyState::Untracked,
        }
    }

    #[must_use]
    pub fn is_snoozed(&self, now: DateTime<Utc>) -> bool {
        self.snooze.is_some_and(|s| s > now)
    }

    /// Counts a hit and says whether the actions should run now.
    pub fn hit(&mut self, profile: &ThresholdProfile, now: DateTime<Utc>) -> bool {
        self.hits += 1;
        !self.is_snoozed(now)
            && self.hits >= profile.min_hits
            && (profile.max_hits == -1 || self.hits <= profile.max_hits)
    }

    /// Starts the quiet period after actions ran.
    pub fn snooze_from(&mut self, profile: &ThresholdProfile, now: DateTime<Utc>) {
        self.snooze = Some(now + to_chrono(profile.min_sleep));
    }

    /// The threshold has used up its hits and should go away.
    #[must_use]
    pub const fn exhausted(&self, profile: &ThresholdProfile) -> bool {
        profile.max_hits != -1 && self.hits >= profile.max_hits
    }

    pub fn reset(&mut self) {
        self.hits = 0;
        self.snooze = None;
    }
}

impl MonitorInstance for Threshold {
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

impl InstanceRecord for Threshold {
    const PREFIX: &'static str = THRESHOLD_PREFIX;

    fn partition(cache: &Cache) -> &CachePartition<SharedInstance<Self>> {
        &cache.thresholds
    }
}
