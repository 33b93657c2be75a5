//! Storage key layout.
//!
//! Every record lives under `<prefix><tenant>:<id>`. Filter indexes live under
//! `fii_<kind>_<tenant[:context]>` and hold the full signature map for that
//! scope.

pub const STAT_QUEUE_PROFILE_PREFIX: &str = "sqp_";
pub const STAT_QUEUE_PREFIX: &str = "stq_";
pub const RESOURCE_PROFILE_PREFIX: &str = "rsp_";
pub const RESOURCE_PREFIX: &str = "res_";
pub const THRESHOLD_PROFILE_PREFIX: &str = "thp_";
pub const THRESHOLD_PREFIX: &str = "thd_";
pub const FILTER_PREFIX: &str = "ftr_";
pub const FILTER_INDEX_PREFIX: &str = "fii_";

/// Which profile family a filter index belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    StatQueueProfile,
    ResourceProfile,
    ThresholdProfile,
}

impl ItemKind {
    pub const ALL: [Self; 3] = [Self::StatQueueProfile, Self::ResourceProfile, Self::ThresholdProfile];

    /// Prefix of the profiles this kind indexes.
    #[must_use]
    pub const fn profile_prefix(self) -> &'static str {
        match self {
            Self::StatQueueProfile => STAT_QUEUE_PROFILE_PREFIX,
            Self::ResourceProfile => RESOURCE_PROFILE_PREFIX,
            Self::ThresholdProfile => THRESHOLD_PROFILE_PREFIX,
        }
    }

    /// Prefix of the instances created from this kind's profiles.
    #[must_use]
    pub const fn instance_prefix(self) -> &'static str {
        match self {
            Self::StatQueueProfile => STAT_QUEUE_PREFIX,
            Self::ResourceProfile => RESOURCE_PREFIX,
            Self::ThresholdProfile => THRESHOLD_PREFIX,
        }
    }
}

/// `<prefix><tenant>:<id>`
#[must_use]
pub fn item_key(prefix: &str, tenant: &str, id: &str) -> String {
    format!("{prefix}{tenant}:{id}")
}

/// Key of the filter index for a profile family and tenant scope.
#[must_use]
pub fn filter_index_key(kind: ItemKind, tenant_ctx: &str) -> String {
    format!("{FILTER_INDEX_PREFIX}{}{tenant_ctx}", kind.profile_prefix())
}

/// Tenant scope used for index keys: `tenant` or `tenant:context`.
#[must_use]
pub fn tenant_context(tenant: &str, context: Option<&str>) -> String {
    match context {
        Some(ctx) if !ctx.is_empty() => format!("{tenant}:{ctx}"),
        _ => tenant.to_string(),
    }
}

/// Extracts the id part from `<prefix><tenant>:<id>`.
#[must_use]
pub fn id_from_key<'a>(key: &'a str, prefix: &str, tenant: &str) -> Option<&'a str> {
    key.strip_prefix(prefix)?.strip_prefix(tenant)?.strip_prefix(':')
}
