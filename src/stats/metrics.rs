//! Running aggregates kept by a stat queue.
//!
//! Every metric remembers the contribution of each event it counted, keyed
//! by event id, so an evicted or replaced event can be subtracted exactly.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MonitorResult, ValidationError};
use crate::event::{field_as_duration, field_as_f64, field_as_time, field_value, fields, value_as_string, EventFields};
use crate::filters::FIELD_REF_PREFIX;
use crate::time::format_duration;

/// Float form of a metric without enough samples.
pub const NOT_AVAILABLE_F64: f64 = -1.0;

/// String form of a metric without enough samples.
pub const NOT_AVAILABLE: &str = "N/A";

/// Separates a metric kind from its field parameter, as in `*sum#~Usage`.
pub const METRIC_PARAM_SEP: char = '#';

/// Supported metric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    /// Answer-seizure ratio, in percent.
    #[serde(rename = "*asr")]
    Asr,
    /// Average call duration.
    #[serde(rename = "*acd")]
    Acd,
    /// Total call duration.
    #[serde(rename = "*tcd")]
    Tcd,
    /// Average call cost.
    #[serde(rename = "*acc")]
    Acc,
    /// Total call cost.
    #[serde(rename = "*tcc")]
    Tcc,
    /// Average post-dial delay.
    #[serde(rename = "*pdd")]
    Pdd,
    /// Distinct destinations.
    #[serde(rename = "*ddc")]
    Ddc,
    #[serde(rename = "*sum")]
    Sum,
    #[serde(rename = "*average")]
    Average,
    #[serde(rename = "*distinct")]
    Distinct,
}

impl MetricKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Asr => "*asr",
            Self::Acd => "*acd",
            Self::Tcd => "*tcd",
            Self::Acc => "*acc",
            Self::Tcc => "*tcc",
            Self::Pdd => "*pdd",
            Self::Ddc => "*ddc",
            Self::Sum => "*sum",
            Self::Average => "*average",
            Self::Distinct => "*distinct",
        }
    }

    /// Kinds that read a caller-chosen field.
    #[must_use]
    pub const fn takes_field(self) -> bool {
        matches!(self, Self::Sum | Self::Average | Self::Distinct)
    }

    const fn is_duration(self) -> bool {
        matches!(self, Self::Acd | Self::Tcd | Self::Pdd)
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "*asr" => Self::Asr,
            "*acd" => Self::Acd,
            "*tcd" => Self::Tcd,
            "*acc" => Self::Acc,
            "*tcc" => Self::Tcc,
            "*pdd" => Self::Pdd,
            "*ddc" => Self::Ddc,
            "*sum" => Self::Sum,
            "*average" => Self::Average,
            "*distinct" => Self::Distinct,
            _ => {
                return Err(ValidationError::UnsupportedMetric {
                    metric_id: s.to_string(),
                })
            }
        };
        Ok(kind)
    }
}

/// Splits a metric id into its kind and optional field.
///
/// # Errors
///
/// `UnsupportedMetric` for unknown kinds, a missing field on `*sum`-style
/// kinds, or a field on kinds that take none.
pub fn parse_metric_id(metric_id: &str) -> Result<(MetricKind, Option<String>), ValidationError> {
    let unsupported = || ValidationError::UnsupportedMetric {
        metric_id: metric_id.to_string(),
    };
    let (base, param) = match metric_id.split_once(METRIC_PARAM_SEP) {
        Some((base, param)) => (base, Some(param)),
        None => (metric_id, None),
    };
    let kind: MetricKind = base.parse().map_err(|_| unsupported())?;
    match (kind.takes_field(), param) {
        (true, Some(p)) => {
            let field = p.strip_prefix(FIELD_REF_PREFIX).unwrap_or(p);
            if field.is_empty() {
                return Err(unsupported());
            }
            Ok((kind, Some(field.to_string())))
        }
        (false, None) => Ok((kind, None)),
        _ => Err(unsupported()),
    }
}

/// What one event contributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum Sample {
    Value(f64),
    Key(String),
}

fn required<T>(v: Option<T>, field: &str) -> MonitorResult<T> {
    v.ok_or_else(|| {
        ValidationError::MissingField {
            field: field.to_string(),
        }
        .into()
    })
}

/// A metric and its running state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatMetric {
    pub metric_id: String,
    kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    field: Option<String>,
    #[serde(default)]
    min_items: usize,
    /// Events must pass these, on top of the queue's filters, to count.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_ids: Vec<String>,
    #[serde(default)]
    samples: BTreeMap<String, Sample>,
    #[serde(default)]
    sum: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    distinct: BTreeMap<String, usize>,
}

impl StatMetric {
    /// # Errors
    ///
    /// `UnsupportedMetric` for a malformed id.
    pub fn new(metric_id: &str, min_items: usize, filter_ids: Vec<String>) -> Result<Self, ValidationError> {
        let (kind, field) = parse_metric_id(metric_id)?;
        Ok(Self {
            metric_id: metric_id.to_string(),
            kind,
            field,
            min_items,
            filter_ids,
            samples: BTreeMap::new(),
            sum: 0.0,
            distinct: BTreeMap::new(),
        })
    }

    #[must_use]
    pub const fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Number of events counted.
    #[must_use]
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    fn sample_from(&self, ev: &EventFields) -> MonitorResult<Sample> {
        let sample = match self.kind {
            MetricKind::Asr => {
                let answered = field_as_time(ev, fields::ANSWER_TIME)?.is_some();
                Sample::Value(if answered { 1.0 } else { 0.0 })
            }
            MetricKind::Acd | MetricKind::Tcd => {
                Sample::Value(required(field_as_duration(ev, fields::USAGE)?, fields::USAGE)?.as_secs_f64())
            }
            MetricKind::Pdd => {
                Sample::Value(required(field_as_duration(ev, fields::PDD)?, fields::PDD)?.as_secs_f64())
            }
            MetricKind::Acc | MetricKind::Tcc => {
                Sample::Value(required(field_as_f64(ev, fields::COST)?, fields::COST)?)
            }
            MetricKind::Ddc => Sample::Key(value_as_string(required(
                field_value(ev, fields::DESTINATION, false),
                fields::DESTINATION,
            )?)),
            MetricKind::Sum | MetricKind::Average => {
                let field = self.field.as_deref().unwrap_or_default();
                // Duration strings count in seconds.
                let v = match field_as_f64(ev, field) {
                    Ok(v) => v,
                    Err(_) => field_as_duration(ev, field)?.map(|d| d.as_secs_f64()),
                };
                Sample::Value(required(v, field)?)
            }
            MetricKind::Distinct => {
                let field = self.field.as_deref().unwrap_or_default();
                Sample::Key(value_as_string(required(field_value(ev, field, true), field)?))
            }
        };
        Ok(sample)
    }

    /// Counts an event, replacing an earlier contribution with the same id.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND:<field>` when the event lacks the field this metric reads,
    /// or a conversion error. The metric is left unchanged.
    pub fn add_event(&mut self, event_id: &str, ev: &EventFields) -> MonitorResult<()> {
        let sample = self.sample_from(ev)?;
        self.remove_event(event_id);
        match &sample {
            Sample::Value(v) => self.sum += v,
            Sample::Key(k) => *self.distinct.entry(k.clone()).or_default() += 1,
        }
        self.samples.insert(event_id.to_string(), sample);
        Ok(())
    }

    /// Subtracts an event's contribution. Unknown ids are ignored.
    pub fn remove_event(&mut self, event_id: &str) {
        match self.samples.remove(event_id) {
            Some(Sample::Value(v)) => {
                self.sum -= v;
                if self.samples.is_empty() {
                    self.sum = 0.0;
                }
            }
            Some(Sample::Key(k)) => {
                if let Some(n) = self.distinct.get_mut(&k) {
                    *n -= 1;
                    if *n == 0 {
                        self.distinct.remove(&k);
                    }
                }
            }
            None => {}
        }
    }

    /// Current value; `None` below `min_items` or with no events.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn value(&self) -> Option<f64> {
        let count = self.samples.len();
        if count == 0 || count < self.min_items {
            return None;
        }
        let n = count as f64;
        let v = match self.kind {
            MetricKind::Asr => (self.sum / n * 100.0 * 100.0).round() / 100.0,
            MetricKind::Acd | MetricKind::Acc | MetricKind::Pdd | MetricKind::Average => self.sum / n,
            MetricKind::Tcd | MetricKind::Tcc | MetricKind::Sum => self.sum,
            MetricKind::Ddc | MetricKind::Distinct => self.distinct.len() as f64,
        };
        Some(v)
    }

    /// Value as a float, `-1` when not available. Durations are in seconds.
    #[must_use]
    pub fn float_value(&self) -> f64 {
        self.value().unwrap_or(NOT_AVAILABLE_F64)
    }

    /// Value for display: `50%`, `1m30s`, `12.5`, or `N/A`.
    #[must_use]
    pub fn string_value(&self) -> String {
        let Some(v) = self.value() else {
            return NOT_AVAILABLE.to_string();
        };
        match self.kind {
            MetricKind::Asr => format!("{v}%"),
            k if k.is_duration() => format_duration(Duration::from_secs_f64(v.max(0.0))),
            _ => v.to_string(),
        }
    }

    /// Same definition, no state. Used to tell whether a profile update
    /// changed the metric layout.
    #[must_use]
    pub fn same_definition(&self, other: &Self) -> bool {
        self.metric_id == other.metric_id && self.min_items == other.min_items && self.filter_ids == other.filter_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(v: serde_json::Value) -> EventFields {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_metric_ids() {
        assert_eq!(parse_metric_id("*asr").unwrap(), (MetricKind::Asr, None));
        assert_eq!(
            parse_metric_id("*sum#~Usage").unwrap(),
            (MetricKind::Sum, Some("Usage".to_string()))
        );
        assert!(parse_metric_id("*sum").is_err());
        assert!(parse_metric_id("*asr#~Usage").is_err());
        assert!(parse_metric_id("*median").is_err());
    }

    #[test]
    fn test_asr_counts_answered_share() {
        let mut m = StatMetric::new("*asr", 0, Vec::new()).unwrap();
        assert_eq!(m.string_value(), NOT_AVAILABLE);
        m.add_event("e1", &ev(json!({"AnswerTime": "2024-01-01T10:00:00Z"}))).unwrap();
        m.add_event("e2", &ev(json!({"AnswerTime": ""}))).unwrap();
        assert_eq!(m.float_value(), 50.0);
        assert_eq!(m.string_value(), "50%");

        m.remove_event("e2");
        assert_eq!(m.float_value(), 100.0);
    }

    #[test]
    fn test_acd_and_tcd_use_durations() {
        let mut acd = StatMetric::new("*acd", 0, Vec::new()).unwrap();
        let mut tcd = StatMetric::new("*tcd", 0, Vec::new()).unwrap();
        for (id, usage) in [("e1", json!("30s")), ("e2", json!(60_000_000_000_u64))] {
            let fields = ev(json!({"Usage": usage}));
            acd.add_event(id, &fields).unwrap();
            tcd.add_event(id, &fields).unwrap();
        }
        assert_eq!(acd.float_value(), 45.0);
        assert_eq!(acd.string_value(), "45s");
        assert_eq!(tcd.string_value(), "1m30s");
    }

    #[test]
    fn test_missing_field_leaves_metric_untouched() {
        let mut m = StatMetric::new("*tcc", 0, Vec::new()).unwrap();
        let err = m.add_event("e1", &ev(json!({"Account": "1001"}))).unwrap_err();
        assert_eq!(err.to_string(), "Validation error: NOT_FOUND:Cost");
        assert_eq!(m.count(), 0);
    }

    #[test]
    fn test_min_items_gates_value() {
        let mut m = StatMetric::new("*acc", 2, Vec::new()).unwrap();
        m.add_event("e1", &ev(json!({"Cost": 1.5}))).unwrap();
        assert_eq!(m.float_value(), NOT_AVAILABLE_F64);
        m.add_event("e2", &ev(json!({"Cost": "2.5"}))).unwrap();
        assert_eq!(m.float_value(), 2.0);
    }

    #[test]
    fn test_readding_event_replaces_contribution() {
        let mut m = StatMetric::new("*sum#~Cost", 0, Vec::new()).unwrap();
        m.add_event("e1", &ev(json!({"Cost": 10}))).unwrap();
        m.add_event("e1", &ev(json!({"Cost": 3}))).unwrap();
        assert_eq!(m.count(), 1);
        assert_eq!(m.float_value(), 3.0);
    }

    #[test]
    fn test_distinct_counts_survive_eviction() {
        let mut m = StatMetric::new("*ddc", 0, Vec::new()).unwrap();
        m.add_event("e1", &ev(json!({"Destination": "+49"}))).unwrap();
        m.add_event("e2", &ev(json!({"Destination": "+49"}))).unwrap();
        m.add_event("e3", &ev(json!({"Destination": "+40"}))).unwrap();
        assert_eq!(m.float_value(), 2.0);
        m.remove_event("e1");
        assert_eq!(m.float_value(), 2.0);
        m.remove_event("e3");
        assert_eq!(m.float_value(), 1.0);
    }

    #[test]
    fn test_state_survives_serde() {
        let mut m = StatMetric::new("*distinct#~Account", 0, Vec::new()).unwrap();
        m.add_event("e1", &ev(json!({"Account": "1001"}))).unwrap();
        let back: StatMetric = serde_json::from_str(&serde_json::to_string(&m).unwrap()).unwrap();
        assert_eq!(back, m);
    }
}
