//! Temporal helpers: activation intervals and duration parsing.
//!
//! Durations are accepted in two shapes wherever they appear in configuration
//! or profiles:
//! - a string with unit suffixes (`"250ms"`, `"1m30s"`, `"2h"`)
//! - an integer, interpreted as nanoseconds

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// The window in which a profile is allowed to match events.
///
/// Half-open interval: `[activation_time, expiry_time)`. Either bound may be
/// absent, meaning unbounded on that side.
///
/// # Examples
///
/// ```
/// use cgmon::time::ActivationInterval;
/// use chrono::{Duration, Utc};
///
/// let now = Utc::now();
/// let window = ActivationInterval::between(now, now + Duration::hours(1)).unwrap();
/// assert!(window.is_active_at(now));
/// assert!(!window.is_active_at(now + Duration::hours(1)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationInterval {
    /// Start of the window (inclusive). None means "since forever".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_time: Option<DateTime<Utc>>,

    /// End of the window (exclusive). None means open-ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_time: Option<DateTime<Utc>>,
}

impl ActivationInterval {
    /// Creates a bounded window.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidProfile` if `from >= to`.
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, ValidationError> {
        if from >= to {
            return Err(ValidationError::InvalidProfile {
                tenant_id: String::new(),
                reason: format!("activation interval start {from} is not before end {to}"),
            });
        }
        Ok(Self {
            activation_time: Some(from),
            expiry_time: Some(to),
        })
    }

    /// Creates an open-ended window starting at the given time.
    #[must_use]
    pub const fn starting_at(from: DateTime<Utc>) -> Self {
        Self {
            activation_time: Some(from),
            expiry_time: None,
        }
    }

    /// Creates a window that ends at the given time.
    #[must_use]
    pub const fn until(to: DateTime<Utc>) -> Self {
        Self {
            activation_time: None,
            expiry_time: Some(to),
        }
    }

    /// Check if a timestamp falls within this window.
    #[must_use]
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.activation_time.map_or(true, |from| at >= from)
            && self.expiry_time.map_or(true, |to| at < to)
    }
}

/// Converts a std duration to a chrono duration, saturating on overflow.
#[must_use]
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Parses a duration string.
///
/// Accepts a plain integer (nanoseconds) or a sequence of decimal numbers
/// with unit suffixes `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`.
///
/// # Errors
///
/// Returns `ValidationError::InvalidDuration` for empty, negative or
/// malformed input.
pub fn parse_duration(input: &str) -> Result<Duration, ValidationError> {
    let invalid = || ValidationError::InvalidDuration {
        value: input.to_string(),
    };

    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }
    if let Ok(nanos) = s.parse::<i64>() {
        return u64::try_from(nanos).map(Duration::from_nanos).map_err(|_| invalid());
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if num_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| invalid())?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        total += value * nanos_per_unit;
        rest = &rest[unit_len..];
    }

    if !total.is_finite() || total > u64::MAX as f64 {
        return Err(invalid());
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(Duration::from_nanos(total.round() as u64))
}

/// Formats a duration the way [`parse_duration`] reads it back, e.g. `1m30s`.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    let total_secs = d.as_secs();
    let nanos = d.subsec_nanos();
    if total_secs == 0 {
        return if nanos % 1_000_000 == 0 {
            format!("{}ms", nanos / 1_000_000)
        } else if nanos % 1_000 == 0 {
            format!("{}us", nanos / 1_000)
        } else {
            format!("{nanos}ns")
        };
    }

    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if secs > 0 || nanos > 0 {
        if nanos == 0 {
            out.push_str(&format!("{secs}s"));
        } else {
            let frac = format!("{nanos:09}");
            out.push_str(&format!("{secs}.{}s", frac.trim_end_matches('0')));
        }
    }
    out
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Nanos(i64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<Duration, ValidationError> {
        match self {
            Self::Nanos(n) => u64::try_from(n)
                .map(Duration::from_nanos)
                .map_err(|_| ValidationError::InvalidDuration { value: n.to_string() }),
            Self::Text(s) => parse_duration(&s),
        }
    }
}

/// Serde adapter for `Duration` fields (`#[serde(with = "cgmon::time::serde_duration")]`).
pub mod serde_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::{format_duration, RawDuration};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        RawDuration::deserialize(d)?
            .into_duration()
            .map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for `Option<Duration>` fields. `null`, missing and negative
/// integers all read as `None`.
pub mod serde_opt_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::{format_duration, RawDuration};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<RawDuration>::deserialize(d)? {
            None => Ok(None),
            Some(RawDuration::Nanos(n)) if n < 0 => Ok(None),
            Some(RawDuration::Text(s)) if s.trim() == "-1" => Ok(None),
            Some(raw) => raw.into_duration().map(Some).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_activation_interval_bounds() {
        let now = Utc::now();
        let window = ActivationInterval::between(now, now + ChronoDuration::minutes(5)).unwrap();
        assert!(window.is_active_at(now));
        assert!(window.is_active_at(now + ChronoDuration::minutes(4)));
        assert!(!window.is_active_at(now - ChronoDuration::seconds(1)));
        assert!(!window.is_active_at(now + ChronoDuration::minutes(5)));
    }

    #[test]
    fn test_activation_interval_open_sides() {
        let now = Utc::now();
        assert!(ActivationInterval::default().is_active_at(now));
        assert!(ActivationInterval::starting_at(now).is_active_at(now + ChronoDuration::days(365)));
        assert!(!ActivationInterval::until(now).is_active_at(now));
    }

    #[test]
    fn test_activation_interval_rejects_inverted_range() {
        let now = Utc::now();
        assert!(ActivationInterval::between(now, now).is_err());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("1000").unwrap(), Duration::from_nanos(1000));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("-5").is_err());
    }

    #[test]
    fn test_format_duration_reads_back() {
        for d in [
            Duration::from_secs(90),
            Duration::from_millis(250),
            Duration::from_millis(1500),
            Duration::from_secs(3600 + 61),
        ] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }

    #[test]
    fn test_serde_opt_duration_negative_is_none() {
        #[derive(Deserialize)]
        struct Holder {
            #[serde(default, with = "serde_opt_duration")]
            ttl: Option<Duration>,
        }

        let h: Holder = serde_json::from_str(r#"{"ttl": -1}"#).unwrap();
        assert_eq!(h.ttl, None);
        let h: Holder = serde_json::from_str(r#"{"ttl": "10s"}"#).unwrap();
        assert_eq!(h.ttl, Some(Duration::from_secs(10)));
        let h: Holder = serde_json::from_str("{}").unwrap();
        assert_eq!(h.ttl, None);
    }
}
