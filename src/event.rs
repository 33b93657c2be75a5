//! Events flowing into the monitoring engines.
//!
//! An event is a tenant-scoped, identified bag of fields. Fields are plain
//! JSON values; nested objects are addressed with dotted paths when the
//! caller allows it.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MonitorError, MonitorResult, ValidationError};
use crate::time::parse_duration;

/// Field map carried by an event.
pub type EventFields = serde_json::Map<String, Value>;

/// Well-known event field names.
pub mod fields {
    pub const ANSWER_TIME: &str = "AnswerTime";
    pub const USAGE: &str = "Usage";
    pub const COST: &str = "Cost";
    pub const PDD: &str = "PDD";
    pub const DESTINATION: &str = "Destination";
    pub const EVENT_TYPE: &str = "EventType";
    pub const STAT_ID: &str = "StatID";
    pub const RESOURCE_ID: &str = "ResourceID";
    pub const STAT_UPDATE: &str = "StatUpdate";
    pub const RESOURCE_UPDATE: &str = "ResourceUpdate";
}

/// Joins parts with `:`, the composite-key separator used everywhere.
#[must_use]
pub fn concat_key(parts: &[&str]) -> String {
    parts.join(":")
}

/// A `(tenant, id)` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId {
    pub tenant: String,
    pub id: String,
}

impl TenantId {
    #[must_use]
    pub fn new(tenant: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            id: id.into(),
        }
    }

    /// Splits a `tenant:id` key. The id may itself contain `:`.
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        let (tenant, id) = key.split_once(':')?;
        if tenant.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(tenant, id))
    }

    /// Returns the mandatory fields that are empty.
    #[must_use]
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.tenant.is_empty() {
            missing.push("Tenant");
        }
        if self.id.is_empty() {
            missing.push("ID");
        }
        missing
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tenant, self.id)
    }
}

/// An inbound event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CgrEvent {
    pub tenant: String,
    pub id: String,
    /// Time the event refers to; activation windows are checked against it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub event: EventFields,
}

impl CgrEvent {
    #[must_use]
    pub fn new(tenant: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            id: id.into(),
            time: None,
            event: EventFields::new(),
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.event.insert(name.into(), value.into());
        self
    }

    /// Builder-style event time setter.
    #[must_use]
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Returns the mandatory parts that are empty.
    #[must_use]
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.tenant.is_empty() {
            missing.push("Tenant");
        }
        if self.id.is_empty() {
            missing.push("ID");
        }
        if self.event.is_empty() {
            missing.push("Event");
        }
        missing
    }

    /// Checks that tenant, id and event are present.
    ///
    /// # Errors
    ///
    /// `MandatoryIeMissing` listing every absent field.
    pub fn validate(&self) -> MonitorResult<()> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MonitorError::mandatory_missing(missing))
        }
    }

    /// The time used for activation checks: the event's own time or now.
    #[must_use]
    pub fn effective_time(&self) -> DateTime<Utc> {
        self.time.unwrap_or_else(Utc::now)
    }
}

/// Looks up a field, following dotted paths into nested objects when the
/// literal key is absent and `nested` is allowed.
#[must_use]
pub fn field_value<'a>(fields: &'a EventFields, path: &str, nested: bool) -> Option<&'a Value> {
    if let Some(v) = fields.get(path) {
        return Some(v);
    }
    if !nested || !path.contains('.') {
        return None;
    }
    let mut parts = path.split('.');
    let mut current = fields.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Renders a field value as the string used in filter comparisons and index
/// keys.
#[must_use]
pub fn value_as_string(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Lists field paths present in the event. With `nested`, objects are
/// flattened into dotted paths.
#[must_use]
pub fn field_paths(fields: &EventFields, nested: bool) -> Vec<String> {
    fn walk(prefix: &str, fields: &EventFields, out: &mut Vec<String>) {
        for (k, v) in fields {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            match v {
                Value::Object(inner) => walk(&path, inner, out),
                _ => out.push(path),
            }
        }
    }

    if !nested {
        return fields.keys().cloned().collect();
    }
    let mut out = Vec::with_capacity(fields.len());
    walk("", fields, &mut out);
    out
}

fn conversion_err(field: &str, target: &'static str, v: &Value) -> MonitorError {
    ValidationError::FieldConversion {
        field: field.to_string(),
        target,
        value: v.to_string(),
    }
    .into()
}

/// Reads a field as a float. Numeric strings are accepted.
///
/// # Errors
///
/// `FieldConversion` when the value is not numeric.
pub fn field_as_f64(fields: &EventFields, field: &str) -> MonitorResult<Option<f64>> {
    let Some(v) = field_value(fields, field, true) else {
        return Ok(None);
    };
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => n.as_f64().map(Some).ok_or_else(|| conversion_err(field, "float", v)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| conversion_err(field, "float", v)),
        _ => Err(conversion_err(field, "float", v)),
    }
}

/// Reads a field as a duration: integers are nanoseconds, strings use unit
/// suffixes.
///
/// # Errors
///
/// `FieldConversion` when the value is not a duration.
pub fn field_as_duration(fields: &EventFields, field: &str) -> MonitorResult<Option<Duration>> {
    let Some(v) = field_value(fields, field, true) else {
        return Ok(None);
    };
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .map(|ns| Some(Duration::from_nanos(ns)))
            .ok_or_else(|| conversion_err(field, "duration", v)),
        Value::String(s) => parse_duration(s).map(Some).map_err(|_| conversion_err(field, "duration", v)),
        _ => Err(conversion_err(field, "duration", v)),
    }
}

/// Reads a field as a timestamp: RFC 3339 strings or unix seconds. The empty
/// string, zero and the zero date all read as `None`.
///
/// # Errors
///
/// `FieldConversion` when the value is not a timestamp.
pub fn field_as_time(fields: &EventFields, field: &str) -> MonitorResult<Option<DateTime<Utc>>> {
    let Some(v) = field_value(fields, field, true) else {
        return Ok(None);
    };
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => {
            let secs = n.as_i64().ok_or_else(|| conversion_err(field, "time", v))?;
            if secs == 0 {
                return Ok(None);
            }
            Utc.timestamp_opt(secs, 0)
                .single()
                .map(Some)
                .ok_or_else(|| conversion_err(field, "time", v))
        }
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() || s.starts_with("0001-01-01") {
                return Ok(None);
            }
            DateTime::parse_from_rfc3339(s)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|_| conversion_err(field, "time", v))
        }
        _ => Err(conversion_err(field, "time", v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> EventFields {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_validate_reports_all_missing() {
        let err = CgrEvent::default().validate().unwrap_err();
        match err {
            MonitorError::MandatoryIeMissing { fields } => {
                assert_eq!(fields, vec!["Tenant", "ID", "Event"]);
            }
            other => panic!("unexpected error {other:?}"),
        }

        let ok = CgrEvent::new("cgrates.org", "ev1").with_field("Account", "1001");
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_nested_lookup_respects_flag() {
        let f = fields(json!({"Cost": {"Usage": 10}}));
        assert_eq!(field_value(&f, "Cost.Usage", true), Some(&json!(10)));
        assert_eq!(field_value(&f, "Cost.Usage", false), None);
    }

    #[test]
    fn test_field_paths_flatten_nested() {
        let f = fields(json!({"Account": "1001", "Cost": {"Usage": 10}}));
        let mut flat = field_paths(&f, true);
        flat.sort();
        assert_eq!(flat, vec!["Account", "Cost.Usage"]);
        let mut top = field_paths(&f, false);
        top.sort();
        assert_eq!(top, vec!["Account", "Cost"]);
    }

    #[test]
    fn test_conversions() {
        let f = fields(json!({
            "Cost": "1.5",
            "Usage": "1m",
            "UsageNs": 1_000_000_000u64,
            "AnswerTime": "2024-01-01T10:00:00Z",
            "Zero": "0001-01-01T00:00:00Z",
            "Bad": [1, 2],
        }));
        assert_eq!(field_as_f64(&f, "Cost").unwrap(), Some(1.5));
        assert_eq!(field_as_duration(&f, "Usage").unwrap(), Some(Duration::from_secs(60)));
        assert_eq!(field_as_duration(&f, "UsageNs").unwrap(), Some(Duration::from_secs(1)));
        assert!(field_as_time(&f, "AnswerTime").unwrap().is_some());
        assert_eq!(field_as_time(&f, "Zero").unwrap(), None);
        assert_eq!(field_as_f64(&f, "Missing").unwrap(), None);
        assert!(field_as_f64(&f, "Bad").is_err());
    }

    #[test]
    fn test_tenant_id_parse() {
        let tid = TenantId::parse("cgrates.org:SQ:1").unwrap();
        assert_eq!(tid.tenant, "cgrates.org");
        assert_eq!(tid.id, "SQ:1");
        assert_eq!(tid.to_string(), "cgrates.org:SQ:1");
        assert!(TenantId::parse("nocolon").is_none());
    }
}
