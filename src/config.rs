//! Runtime configuration.
//!
//! Every section has a `Default` that yields a working in-process setup and a
//! `validate()` that rejects inconsistent values up front. Loading from files
//! is left to the embedding application; [`MonitorConfig::from_json_str`]
//! covers the server binary.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{MonitorResult, ValidationError};
use crate::time::{format_duration, parse_duration, serde_duration};

/// When changed instances are written back to storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreInterval {
    /// Never persist (`0`).
    #[default]
    Never,
    /// Persist inside the event, before returning (`-1`).
    Synchronous,
    /// Queue the key and let the backup loop persist it.
    Every(Duration),
}

impl StoreInterval {
    /// Parses `"0"`, `"-1"`, an integer in nanoseconds, or a duration string.
    ///
    /// # Errors
    ///
    /// `InvalidStoreInterval` for anything else.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s.trim() {
            "-1" => Ok(Self::Synchronous),
            other => {
                let d = parse_duration(other).map_err(|_| ValidationError::InvalidStoreInterval {
                    value: s.to_string(),
                })?;
                Ok(Self::from_duration(d))
            }
        }
    }

    fn from_duration(d: Duration) -> Self {
        if d.is_zero() {
            Self::Never
        } else {
            Self::Every(d)
        }
    }

    /// The backup period, if a backup loop is needed.
    #[must_use]
    pub const fn backup_period(self) -> Option<Duration> {
        match self {
            Self::Every(d) => Some(d),
            _ => None,
        }
    }
}

impl fmt::Display for StoreInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("0"),
            Self::Synchronous => f.write_str("-1"),
            Self::Every(d) => f.write_str(&format_duration(*d)),
        }
    }
}

impl Serialize for StoreInterval {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for StoreInterval {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Text(String),
        }

        match Raw::deserialize(d)? {
            Raw::Int(-1) => Ok(Self::Synchronous),
            Raw::Int(n) => u64::try_from(n)
                .map(|ns| Self::from_duration(Duration::from_nanos(ns)))
                .map_err(|_| serde::de::Error::custom(format!("invalid store interval {n}"))),
            Raw::Text(s) => Self::parse(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// How profile candidates are selected for an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingOpts {
    /// Use the filter indexes. When false every profile of the tenant is a
    /// candidate.
    pub indexed_selects: bool,
    /// Fields looked up with `*string` signatures. `None` means every field
    /// of the event.
    pub string_indexed_fields: Option<Vec<String>>,
    /// Fields looked up with `*prefix` signatures.
    pub prefix_indexed_fields: Vec<String>,
    /// Resolve dotted field paths into nested objects.
    pub nested_fields: bool,
}

impl Default for IndexingOpts {
    fn default() -> Self {
        Self {
            indexed_selects: true,
            string_indexed_fields: None,
            prefix_indexed_fields: Vec::new(),
            nested_fields: false,
        }
    }
}

impl IndexingOpts {
    /// True when the configuration disables index lookups entirely.
    #[must_use]
    pub fn full_scan(&self) -> bool {
        !self.indexed_selects
            || (self
                .string_indexed_fields
                .as_ref()
                .is_some_and(Vec::is_empty)
                && self.prefix_indexed_fields.is_empty())
    }

    fn validate(&self, section: &str) -> Result<(), ValidationError> {
        let blank = self
            .string_indexed_fields
            .iter()
            .flatten()
            .chain(&self.prefix_indexed_fields)
            .any(|f| f.trim().is_empty());
        if blank {
            return Err(ValidationError::InvalidConfig {
                reason: format!("{section}: indexed field names must not be empty"),
            });
        }
        Ok(())
    }
}

/// Log output layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Settings shared by every service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Node identifier, used in log lines.
    pub node_id: String,
    /// Overall wait for per-instance locks. Zero waits forever.
    #[serde(with = "serde_duration")]
    pub locking_timeout: Duration,
    /// Default filter directive; `RUST_LOG` wins when set.
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            node_id: "cgmon".to_string(),
            locking_timeout: Duration::ZERO,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

/// Statistics service settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub enabled: bool,
    pub store_interval: StoreInterval,
    /// Non-empty enables the cascade into thresholds.
    pub threshold_conns: Vec<String>,
    #[serde(flatten)]
    pub indexing: IndexingOpts,
}

/// Resource service settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub enabled: bool,
    pub store_interval: StoreInterval,
    pub threshold_conns: Vec<String>,
    #[serde(flatten)]
    pub indexing: IndexingOpts,
}

/// Threshold service settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    pub enabled: bool,
    pub store_interval: StoreInterval,
    #[serde(flatten)]
    pub indexing: IndexingOpts,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub general: GeneralConfig,
    pub stats: StatsConfig,
    pub resources: ResourcesConfig,
    pub thresholds: ThresholdsConfig,
}

impl MonitorConfig {
    /// Parses and validates a JSON document. Missing sections keep defaults.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for malformed JSON or failed validation.
    pub fn from_json_str(json: &str) -> MonitorResult<Self> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// # Errors
    ///
    /// `InvalidConfig` naming the first offending setting.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.stats.indexing.validate("stats")?;
        self.resources.indexing.validate("resources")?;
        self.thresholds.indexing.validate("thresholds")?;

        let cascades = (self.stats.enabled && !self.stats.threshold_conns.is_empty())
            || (self.resources.enabled && !self.resources.threshold_conns.is_empty());
        if cascades && !self.thresholds.enabled {
            return Err(ValidationError::InvalidConfig {
                reason: "threshold_conns configured but the thresholds service is disabled".to_string(),
            });
        }
        Ok(())
    }
}
