//! Filters: the predicate side of profile matching.
//!
//! A profile lists filter ids; an event matches the profile only if every
//! filter passes. Ids are either stored filters (`FLTR_1`) or inline rules
//! written as `<kind>:<element>:<v1>|<v2>`, e.g. `*string:~Account:1001|1002`.
//!
//! Elements and values starting with `~` reference event fields; anything
//! else is a constant.

pub mod indexer;

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, MonitorResult, ValidationError};
use crate::event::{field_value, value_as_string, CgrEvent, EventFields};
use crate::storage::DataManager;
use crate::time::{parse_duration, ActivationInterval};

pub use indexer::{FilterIndex, FilterIndexer};

/// Marks an element or value as a field reference.
pub const FIELD_REF_PREFIX: char = '~';

/// Separator between values of an inline rule.
pub const INLINE_VALUE_SEP: char = '|';

/// Rule kinds understood by the default evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    #[serde(rename = "*string")]
    String,
    #[serde(rename = "*prefix")]
    Prefix,
    #[serde(rename = "*suffix")]
    Suffix,
    #[serde(rename = "*exists")]
    Exists,
    #[serde(rename = "*regex")]
    Regex,
    #[serde(rename = "*gt")]
    Gt,
    #[serde(rename = "*gte")]
    Gte,
    #[serde(rename = "*lt")]
    Lt,
    #[serde(rename = "*lte")]
    Lte,
    #[serde(rename = "*notstring")]
    NotString,
    #[serde(rename = "*notprefix")]
    NotPrefix,
    #[serde(rename = "*notsuffix")]
    NotSuffix,
    #[serde(rename = "*notexists")]
    NotExists,
    #[serde(rename = "*notregex")]
    NotRegex,
}

impl RuleKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "*string",
            Self::Prefix => "*prefix",
            Self::Suffix => "*suffix",
            Self::Exists => "*exists",
            Self::Regex => "*regex",
            Self::Gt => "*gt",
            Self::Gte => "*gte",
            Self::Lt => "*lt",
            Self::Lte => "*lte",
            Self::NotString => "*notstring",
            Self::NotPrefix => "*notprefix",
            Self::NotSuffix => "*notsuffix",
            Self::NotExists => "*notexists",
            Self::NotRegex => "*notregex",
        }
    }

    /// The positive kind this one negates, if any.
    #[must_use]
    pub const fn negated_of(self) -> Option<Self> {
        match self {
            Self::NotString => Some(Self::String),
            Self::NotPrefix => Some(Self::Prefix),
            Self::NotSuffix => Some(Self::Suffix),
            Self::NotExists => Some(Self::Exists),
            Self::NotRegex => Some(Self::Regex),
            _ => None,
        }
    }

    const fn takes_values(self) -> bool {
        !matches!(self, Self::Exists | Self::NotExists)
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "*string" => Self::String,
            "*prefix" => Self::Prefix,
            "*suffix" => Self::Suffix,
            "*exists" => Self::Exists,
            "*regex" => Self::Regex,
            "*gt" => Self::Gt,
            "*gte" => Self::Gte,
            "*lt" => Self::Lt,
            "*lte" => Self::Lte,
            "*notstring" => Self::NotString,
            "*notprefix" => Self::NotPrefix,
            "*notsuffix" => Self::NotSuffix,
            "*notexists" => Self::NotExists,
            "*notregex" => Self::NotRegex,
            other => {
                return Err(ValidationError::UnsupportedFilterType {
                    kind: other.to_string(),
                })
            }
        })
    }
}

/// One condition of a filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub kind: RuleKind,
    /// Field reference, `~Account` or `~Cost.Usage`.
    pub element: String,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(skip)]
    regexes: Vec<Regex>,
}

impl PartialEq for FilterRule {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.element == other.element && self.values == other.values
    }
}

impl FilterRule {
    /// Builds and validates a rule.
    ///
    /// # Errors
    ///
    /// `InvalidFilterRule` on a missing element, missing or superfluous
    /// values, or a malformed regex.
    pub fn new(
        kind: RuleKind,
        element: impl Into<String>,
        values: Vec<String>,
    ) -> Result<Self, ValidationError> {
        let mut rule = Self {
            kind,
            element: element.into(),
            values,
            regexes: Vec::new(),
        };
        rule.compile()?;
        Ok(rule)
    }

    /// Parses an inline rule such as `*prefix:~Destination:+49|+33`.
    ///
    /// # Errors
    ///
    /// `UnsupportedFilterType` or `InvalidFilterRule` on malformed input.
    pub fn parse_inline(id: &str) -> Result<Self, ValidationError> {
        let mut parts = id.splitn(3, ':');
        let kind: RuleKind = parts.next().unwrap_or_default().parse()?;
        let element = parts.next().ok_or_else(|| ValidationError::InvalidFilterRule {
            reason: format!("inline filter '{id}' has no element"),
        })?;
        let values = parts
            .next()
            .filter(|v| !v.is_empty())
            .map(|v| v.split(INLINE_VALUE_SEP).map(str::to_string).collect())
            .unwrap_or_default();
        Self::new(kind, element, values)
    }

    /// Validates the rule and compiles regexes. Called after deserializing.
    ///
    /// # Errors
    ///
    /// See [`FilterRule::new`].
    pub fn compile(&mut self) -> Result<(), ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidFilterRule { reason };
        if self.field_path().is_empty() {
            return Err(invalid(format!("{} rule has no element", self.kind)));
        }
        match (self.kind.takes_values(), self.values.is_empty()) {
            (true, true) => return Err(invalid(format!("{} rule on {} needs values", self.kind, self.element))),
            (false, false) => return Err(invalid(format!("{} rule on {} takes no values", self.kind, self.element))),
            _ => {}
        }
        self.regexes.clear();
        if matches!(self.kind, RuleKind::Regex | RuleKind::NotRegex) {
            for v in &self.values {
                let re = Regex::new(v).map_err(|e| invalid(format!("bad regex '{v}': {e}")))?;
                self.regexes.push(re);
            }
        }
        Ok(())
    }

    /// Element with the field-reference marker stripped.
    #[must_use]
    pub fn field_path(&self) -> &str {
        self.element.trim_start_matches(FIELD_REF_PREFIX)
    }

    /// True for `*string`/`*prefix` rules over constants, the only ones the
    /// indexer can use.
    #[must_use]
    pub fn is_indexable(&self) -> bool {
        matches!(self.kind, RuleKind::String | RuleKind::Prefix)
            && self.element.starts_with(FIELD_REF_PREFIX)
            && self.values.iter().all(|v| !v.starts_with(FIELD_REF_PREFIX))
    }

    fn resolve_values(&self, fields: &EventFields, nested: bool) -> Vec<String> {
        self.values
            .iter()
            .filter_map(|v| match v.strip_prefix(FIELD_REF_PREFIX) {
                Some(path) => field_value(fields, path, nested).map(value_as_string),
                None => Some(v.clone()),
            })
            .collect()
    }

    /// Evaluates the rule against event fields.
    #[must_use]
    pub fn pass(&self, fields: &EventFields, nested: bool) -> bool {
        if let Some(positive) = self.kind.negated_of() {
            return !self.eval(positive, fields, nested);
        }
        self.eval(self.kind, fields, nested)
    }

    fn eval(&self, kind: RuleKind, fields: &EventFields, nested: bool) -> bool {
        let field = field_value(fields, self.field_path(), nested).filter(|v| !v.is_null());
        if kind == RuleKind::Exists {
            return field.is_some();
        }
        let Some(field) = field else {
            return false;
        };
        let actual = value_as_string(field);
        match kind {
            RuleKind::Regex => self.regexes.iter().any(|re| re.is_match(&actual)),
            RuleKind::String => self.resolve_values(fields, nested).iter().any(|v| *v == actual),
            RuleKind::Prefix => self.resolve_values(fields, nested).iter().any(|v| actual.starts_with(v.as_str())),
            RuleKind::Suffix => self.resolve_values(fields, nested).iter().any(|v| actual.ends_with(v.as_str())),
            RuleKind::Gt | RuleKind::Gte | RuleKind::Lt | RuleKind::Lte => {
                self.resolve_values(fields, nested).iter().any(|v| {
                    compare_values(&actual, v).is_some_and(|ord| match kind {
                        RuleKind::Gt => ord == Ordering::Greater,
                        RuleKind::Gte => ord != Ordering::Less,
                        RuleKind::Lt => ord == Ordering::Less,
                        _ => ord != Ordering::Greater,
                    })
                })
            }
            _ => false,
        }
    }
}

/// Orders two rendered values as numbers, durations or timestamps, in that
/// order of preference. Values of different shapes are not comparable.
fn compare_values(left: &str, right: &str) -> Option<Ordering> {
    if let (Ok(l), Ok(r)) = (left.parse::<f64>(), right.parse::<f64>()) {
        return l.partial_cmp(&r);
    }
    if let (Ok(l), Ok(r)) = (parse_duration(left), parse_duration(right)) {
        return Some(l.cmp(&r));
    }
    if let (Ok(l), Ok(r)) = (
        DateTime::parse_from_rfc3339(left),
        DateTime::parse_from_rfc3339(right),
    ) {
        return Some(l.with_timezone(&Utc).cmp(&r.with_timezone(&Utc)));
    }
    None
}

/// A named, stored set of rules. All rules must pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub tenant: String,
    pub id: String,
    pub rules: Vec<FilterRule>,
    /// Outside this window the filter is ignored, i.e. it passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_interval: Option<ActivationInterval>,
}

impl Filter {
    #[must_use]
    pub fn new(tenant: impl Into<String>, id: impl Into<String>, rules: Vec<FilterRule>) -> Self {
        Self {
            tenant: tenant.into(),
            id: id.into(),
            rules,
            activation_interval: None,
        }
    }

    /// Validates every rule and compiles regexes.
    ///
    /// # Errors
    ///
    /// The first invalid rule, or a filter with no rules.
    pub fn compile(&mut self) -> Result<(), ValidationError> {
        if self.rules.is_empty() {
            return Err(ValidationError::InvalidFilterRule {
                reason: format!("filter {}:{} has no rules", self.tenant, self.id),
            });
        }
        self.rules.iter_mut().try_for_each(FilterRule::compile)
    }

    #[must_use]
    pub fn pass(&self, fields: &EventFields, nested: bool) -> bool {
        self.rules.iter().all(|r| r.pass(fields, nested))
    }
}

/// Decides whether an event passes a list of filters.
///
/// The engines only depend on this trait; [`FilterService`] is the stock
/// implementation.
pub trait FilterPredicate: Send + Sync {
    /// Returns `Ok(true)` when every filter passes. An empty list passes.
    ///
    /// # Errors
    ///
    /// A referenced filter is missing or malformed.
    fn pass(&self, tenant: &str, filter_ids: &[String], event: &CgrEvent) -> MonitorResult<bool>;
}

/// Evaluates stored and inline filters through the data manager.
pub struct FilterService {
    dm: Arc<DataManager>,
    nested_fields: bool,
}

impl FilterService {
    #[must_use]
    pub fn new(dm: Arc<DataManager>, nested_fields: bool) -> Self {
        Self { dm, nested_fields }
    }
}

impl FilterPredicate for FilterService {
    fn pass(&self, tenant: &str, filter_ids: &[String], event: &CgrEvent) -> MonitorResult<bool> {
        let at = event.effective_time();
        for fid in filter_ids {
            if fid.starts_with('*') {
                if !FilterRule::parse_inline(fid)?.pass(&event.event, self.nested_fields) {
                    return Ok(false);
                }
                continue;
            }

            let filter = self.dm.get_filter(tenant, fid, true, true).map_err(|e| match e {
                MonitorError::NotFound => ValidationError::UnknownFilter {
                    filter_id: fid.clone(),
                }
                .into(),
                other => other,
            })?;
            if filter
                .activation_interval
                .as_ref()
                .is_some_and(|ai| !ai.is_active_at(at))
            {
                continue;
            }
            if !filter.pass(&event.event, self.nested_fields) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
