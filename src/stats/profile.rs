use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{Cache, CachePartition};
use crate::engine::{MonitorProfile, ProfileRecord};
use crate::error::ValidationError;
use crate::storage::keys::ItemKind;
use crate::time::{serde_opt_duration, ActivationInterval};

use super::metrics::parse_metric_id;

/// Cascade target list that disables the threshold cascade for a queue.
pub const NO_THRESHOLDS: &str = "*none";

/// A metric as configured on a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricWithFilters {
    pub metric_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_ids: Vec<String>,
}

impl MetricWithFilters {
    #[must_use]
    pub fn new(metric_id: impl Into<String>) -> Self {
        Self {
            metric_id: metric_id.into(),
            filter_ids: Vec::new(),
        }
    }
}

/// Configuration of one stat queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatQueueProfile {
    pub tenant: String,
    pub id: String,
    pub filter_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_interval: Option<ActivationInterval>,
    /// Maximum samples kept; 0 keeps everything.
    pub queue_length: usize,
    /// Samples older than this are dropped on the next event.
    #[serde(with = "serde_opt_duration", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
    /// Metrics report N/A below this many samples.
    pub min_items: usize,
    pub metrics: Vec<MetricWithFilters>,
    pub stored: bool,
    pub blocker: bool,
    pub weight: f64,
    /// Thresholds receiving this queue's updates. Empty selects them by
    /// index; `["*none"]` disables the cascade.
    pub threshold_ids: Vec<String>,
}

impl Default for StatQueueProfile {
    fn default() -> Self {
        Self {
            tenant: String::new(),
            id: String::new(),
            filter_ids: Vec::new(),
            activation_interval: None,
            queue_length: 0,
            ttl: None,
            min_items: 0,
            metrics: Vec::new(),
            stored: false,
            blocker: false,
            weight: 0.0,
            threshold_ids: Vec::new(),
        }
    }
}

impl StatQueueProfile {
    #[must_use]
    pub fn new(tenant: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            id: id.into(),
            ..Self::default()
        }
    }

    /// Builder-style metric setter.
    #[must_use]
    pub fn with_metrics(mut self, ids: &[&str]) -> Self {
        self.metrics = ids.iter().map(|id| MetricWithFilters::new(*id)).collect();
        self
    }

    /// Cascade targets, `None` when the cascade is disabled for this queue.
    #[must_use]
    pub fn cascade_ids(&self) -> Option<&[String]> {
        if self.threshold_ids.len() == 1 && self.threshold_ids[0] == NO_THRESHOLDS {
            return None;
        }
        Some(&self.threshold_ids)
    }
}

impl MonitorProfile for StatQueueProfile {
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
        let mut seen = std::collections::HashSet::new();
        for m in &self.metrics {
            parse_metric_id(&m.metric_id)?;
            if !seen.insert(m.metric_id.as_str()) {
                return Err(ValidationError::InvalidProfile {
                    tenant_id: format!("{}:{}", self.tenant, self.id),
                    reason: format!("duplicate metric {}", m.metric_id),
                });
            }
        }
        Ok(())
    }
}

impl ProfileRecord for StatQueueProfile {
    const KIND: ItemKind = ItemKind::StatQueueProfile;

    fn partition(cache: &Cache) -> &CachePartition<Arc<Self>> {
        &cache.stat_queue_profiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_with_defaults() {
        let p: StatQueueProfile = serde_json::from_value(json!({
            "tenant": "cgrates.org",
            "id": "SQ_1",
            "queue_length": 10,
            "ttl": "1h",
            "metrics": [{"metric_id": "*asr"}, {"metric_id": "*sum#~Cost", "filter_ids": ["*gt:~Cost:0"]}],
        }))
        .unwrap();
        assert_eq!(p.ttl, Some(Duration::from_secs(3600)));
        assert_eq!(p.metrics[1].filter_ids, vec!["*gt:~Cost:0"]);
        assert!(!p.stored);
        p.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_and_duplicate_metrics() {
        let p = StatQueueProfile::new("t", "SQ").with_metrics(&["*asr", "*nope"]);
        assert!(matches!(p.validate(), Err(ValidationError::UnsupportedMetric { .. })));

        let p = StatQueueProfile::new("t", "SQ").with_metrics(&["*asr", "*asr"]);
        assert!(matches!(p.validate(), Err(ValidationError::InvalidProfile { .. })));
    }

    #[test]
    fn test_cascade_ids() {
        let mut p = StatQueueProfile::new("t", "SQ");
        assert_eq!(p.cascade_ids(), Some(&[][..]));
        p.threshold_ids = vec![NO_THRESHOLDS.to_string()];
        assert_eq!(p.cascade_ids(), None);
    }
}
