use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{Cache, CachePartition, SharedInstance};
use crate::engine::{DirtyState, InstanceRecord, MonitorInstance};
use crate::error::{MonitorError, MonitorResult};
use crate::event::CgrEvent;
use crate::filters::FilterPredicate;
use crate::storage::keys::STAT_QUEUE_PREFIX;
use crate::time::to_chrono;

use super::metrics::StatMetric;
use super::profile::StatQueueProfile;

/// One event held by a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqItem {
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

/// Live state of a stat queue: the retained events and the metrics over
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatQueue {
    pub tenant: String,
    pub id: String,
    #[serde(default)]
    pub sq_items: VecDeque<SqItem>,
    #[serde(default)]
    pub sq_metrics: BTreeMap<String, StatMetric>,
    #[serde(skip)]
    dirty: DirtyState,
    #[serde(skip)]
    ttl: Option<Duration>,
}

impl StatQueue {
    /// Empty queue with the profile's metrics.
    #[must_use]
    pub fn new(profile: &StatQueueProfile) -> Self {
        let mut sq_metrics = BTreeMap::new();
        for m in &profile.metrics {
            match StatMetric::new(&m.metric_id, profile.min_items, m.filter_ids.clone()) {
                Ok(metric) => {
                    sq_metrics.insert(m.metric_id.clone(), metric);
                }
                Err(e) => tracing::warn!(queue = %profile.id, error = %e, "skipping metric"),
            }
        }
        Self {
            tenant: profile.tenant.clone(),
            id: profile.id.clone(),
            sq_items: VecDeque::new(),
            sq_metrics,
            dirty: DirtyState::Untracked,
            ttl: profile.ttl,
        }
    }

    /// In-memory TTL override, refreshed from the profile on every event.
    pub fn set_ttl(&mut self, ttl: Option<Duration>) {
        self.ttl = ttl;
    }

    #[must_use]
    pub const fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    fn forget(&mut self, event_id: &str) {
        for metric in self.sq_metrics.values_mut() {
            metric.remove_event(event_id);
        }
    }

    fn remove_item(&mut self, event_id: &str) {
        if let Some(pos) = self.sq_items.iter().position(|i| i.event_id == event_id) {
            self.sq_items.remove(pos);
            self.forget(event_id);
        }
    }

    /// Drops every item whose expiry is at or before `now`.
    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .sq_items
            .iter()
            .filter(|i| i.expiry.is_some_and(|e| e <= now))
            .map(|i| i.event_id.clone())
            .collect();
        for id in &expired {
            self.remove_item(id);
        }
        expired.len()
    }

    /// Drops the oldest items until one more fits in `queue_length`.
    fn make_room(&mut self, queue_length: usize) {
        if queue_length == 0 {
            return;
        }
        while self.sq_items.len() >= queue_length {
            let Some(oldest) = self.sq_items.pop_front() else {
                break;
            };
            self.forget(&oldest.event_id);
        }
    }

    /// Adds an event: expire, evict, push, then update every metric whose
    /// filters pass. A metric failure does not stop the others.
    ///
    /// # Errors
    ///
    /// The first metric or filter error.
    pub fn process_event(
        &mut self,
        profile: &StatQueueProfile,
        event: &CgrEvent,
        filters: &dyn FilterPredicate,
    ) -> MonitorResult<()> {
        let now = Utc::now();
        self.remove_item(&event.id);
        self.remove_expired(now);
        self.make_room(profile.queue_length);
        self.sq_items.push_back(SqItem {
            event_id: event.id.clone(),
            expiry: self.ttl.map(|ttl| now + to_chrono(ttl)),
        });

        let mut first_err: Option<MonitorError> = None;
        for (metric_id, metric) in &mut self.sq_metrics {
            let counted = if metric.filter_ids.is_empty() {
                Ok(true)
            } else {
                filters.pass(&event.tenant, &metric.filter_ids, event)
            };
            let result = counted.and_then(|pass| {
                if pass {
                    metric.add_event(&event.id, &event.event)
                } else {
                    Ok(())
                }
            });
            if let Err(e) = result {
                tracing::warn!(queue = %self.id, metric = %metric_id, event = %event.id, error = %e, "metric update failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Metric id → float value.
    #[must_use]
    pub fn float_metrics(&self) -> BTreeMap<String, f64> {
        self.sq_metrics
            .iter()
            .map(|(id, m)| (id.clone(), m.float_value()))
            .collect()
    }

    /// Metric id → display value.
    #[must_use]
    pub fn string_metrics(&self) -> BTreeMap<String, String> {
        self.sq_metrics
            .iter()
            .map(|(id, m)| (id.clone(), m.string_value()))
            .collect()
    }
}

impl MonitorInstance for StatQueue {
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

impl InstanceRecord for StatQueue {
    const PREFIX: &'static str = STAT_QUEUE_PREFIX;

    fn partition(cache: &Cache) -> &CachePartition<SharedInstance<Self>> {
        &cache.stat_queues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::profile::MetricWithFilters;

    /// Passes when the event's Account is 1001.
    struct AccountIs1001;

    impl FilterPredicate for AccountIs1001 {
        fn pass(&self, _tenant: &str, _filter_ids: &[String], event: &CgrEvent) -> MonitorResult<bool> {
            Ok(event.event.get("Account").and_then(|v| v.as_str()) == Some("1001"))
        }
    }

    fn call(id: &str, account: &str, usage: &str) -> CgrEvent {
        CgrEvent::new("t", id)
            .with_field("Account", account)
            .with_field("Usage", usage)
            .with_field("AnswerTime", "2024-01-01T10:00:00Z")
    }

    #[test]
    fn test_queue_length_evicts_oldest() {
        let mut profile = StatQueueProfile::new("t", "SQ").with_metrics(&["*tcd"]);
        profile.queue_length = 2;
        let mut sq = StatQueue::new(&profile);
        for (id, usage) in [("e1", "10s"), ("e2", "20s"), ("e3", "30s")] {
            sq.process_event(&profile, &call(id, "1001", usage), &AccountIs1001).unwrap();
        }
        let ids: Vec<_> = sq.sq_items.iter().map(|i| i.event_id.as_str()).collect();
        assert_eq!(ids, vec!["e2", "e3"]);
        assert_eq!(sq.float_metrics()["*tcd"], 50.0);
    }

    #[test]
    fn test_expired_items_leave_metrics() {
        let profile = StatQueueProfile::new("t", "SQ").with_metrics(&["*tcd"]);
        let mut sq = StatQueue::new(&profile);
        sq.set_ttl(Some(Duration::from_secs(60)));
        sq.process_event(&profile, &call("e1", "1001", "10s"), &AccountIs1001).unwrap();

        assert_eq!(sq.remove_expired(Utc::now()), 0);
        assert_eq!(sq.remove_expired(Utc::now() + chrono::Duration::minutes(2)), 1);
        assert!(sq.sq_items.is_empty());
        assert_eq!(sq.string_metrics()["*tcd"], "N/A");
    }

    #[test]
    fn test_duplicate_event_replaces_entry() {
        let profile = StatQueueProfile::new("t", "SQ").with_metrics(&["*tcd"]);
        let mut sq = StatQueue::new(&profile);
        sq.process_event(&profile, &call("e1", "1001", "10s"), &AccountIs1001).unwrap();
        sq.process_event(&profile, &call("e1", "1001", "25s"), &AccountIs1001).unwrap();
        assert_eq!(sq.sq_items.len(), 1);
        assert_eq!(sq.float_metrics()["*tcd"], 25.0);
    }

    #[test]
    fn test_metric_filters_and_failures() {
        let mut profile = StatQueueProfile::new("t", "SQ");
        profile.metrics = vec![
            MetricWithFilters {
                metric_id: "*tcd".to_string(),
                filter_ids: vec!["ACC_1001".to_string()],
            },
            MetricWithFilters::new("*tcc"),
            MetricWithFilters::new("*asr"),
        ];
        let mut sq = StatQueue::new(&profile);

        // *tcc needs Cost; the other metrics still count the event.
        let err = sq
            .process_event(&profile, &call("e1", "1002", "10s"), &AccountIs1001)
            .unwrap_err();
        assert_eq!(err.to_string(), "Validation error: NOT_FOUND:Cost");
        assert_eq!(sq.sq_metrics["*asr"].count(), 1);
        assert_eq!(sq.sq_metrics["*tcd"].count(), 0);

        let ev = call("e2", "1001", "10s").with_field("Cost", 1.0);
        sq.process_event(&profile, &ev, &AccountIs1001).unwrap();
        assert_eq!(sq.sq_metrics["*tcd"].count(), 1);
    }

    #[test]
    fn test_dirty_state_is_not_serialized() {
        let profile = StatQueueProfile::new("t", "SQ").with_metrics(&["*asr"]);
        let mut sq = StatQueue::new(&profile);
        sq.set_dirty_state(DirtyState::Dirty);
        let json = serde_json::to_value(&sq).unwrap();
        assert!(json.get("dirty").is_none());
        let back: StatQueue = serde_json::from_value(json).unwrap();
        assert_eq!(back.dirty_state(), DirtyState::Untracked);
        assert!(back.sq_metrics.contains_key("*asr"));
    }
}
