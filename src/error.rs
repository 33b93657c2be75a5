//! Error types for cgmon.
//!
//! Errors are strongly typed using thiserror. The top-level [`MonitorError`]
//! carries the caller-visible taxonomy (`NOT_FOUND`, `MANDATORY_IE_MISSING`,
//! `PARTIALLY_EXECUTED`, ...). Lower layers keep their own enums and convert
//! into it.

use thiserror::Error;

use crate::storage::StorageError;

/// Validation errors raised while parsing configuration, profiles or rules.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid duration '{value}'")]
    InvalidDuration {
        value: String,
    },

    #[error("Invalid store interval '{value}'")]
    InvalidStoreInterval {
        value: String,
    },

    #[error("Invalid filter rule: {reason}")]
    InvalidFilterRule {
        reason: String,
    },

    #[error("Unsupported filter type '{kind}'")]
    UnsupportedFilterType {
        kind: String,
    },

    #[error("Unsupported metric '{metric_id}'")]
    UnsupportedMetric {
        metric_id: String,
    },

    #[error("Invalid profile {tenant_id}: {reason}")]
    InvalidProfile {
        tenant_id: String,
        reason: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    /// A referenced filter does not exist.
    #[error("NOT_FOUND:{filter_id}")]
    UnknownFilter {
        filter_id: String,
    },

    /// The filter is still referenced by profiles.
    #[error("Filter {filter_id} is used by {}", items.join(", "))]
    FilterInUse {
        filter_id: String,
        items: Vec<String>,
    },

    /// A field a metric needs is absent from the event.
    #[error("NOT_FOUND:{field}")]
    MissingField {
        field: String,
    },

    #[error("Unknown method '{method}'")]
    UnknownMethod {
        method: String,
    },

    #[error("Invalid parameters for {method}: {reason}")]
    InvalidParams {
        method: String,
        reason: String,
    },

    #[error("Field '{field}' cannot be converted to {target}: {value}")]
    FieldConversion {
        field: String,
        target: &'static str,
        value: String,
    },
}

/// Top-level error type for cgmon.
///
/// The first five variants are the ones callers are expected to branch on;
/// everything else is an unexpected condition that the RPC layer folds into
/// [`MonitorError::ServerError`].
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("NOT_FOUND")]
    NotFound,

    #[error("MANDATORY_IE_MISSING: [{}]", fields.join(" "))]
    MandatoryIeMissing {
        fields: Vec<String>,
    },

    /// Some, but not all, matched instances were processed. `ids` holds every
    /// matched instance id, in processing order.
    #[error("PARTIALLY_EXECUTED")]
    PartiallyExecuted {
        ids: Vec<String>,
    },

    #[error("RESOURCE_UNAVAILABLE")]
    ResourceUnavailable,

    #[error("SERVER_ERROR: {message}")]
    ServerError {
        message: String,
    },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[source] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl From<StorageError> for MonitorError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::KeyNotFound(_) => Self::NotFound,
            other => Self::Storage(other),
        }
    }
}

impl MonitorError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a mandatory-field error for the given field names.
    #[must_use]
    pub fn mandatory_missing<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::MandatoryIeMissing {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if this is a `NOT_FOUND` error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Returns true if this is a `PARTIALLY_EXECUTED` error.
    #[must_use]
    pub const fn is_partially_executed(&self) -> bool {
        matches!(self, Self::PartiallyExecuted { .. })
    }

    /// Returns true if the error was caused by the caller's input.
    #[must_use]
    pub const fn is_caller_error(&self) -> bool {
        matches!(self, Self::MandatoryIeMissing { .. } | Self::Validation(_))
    }

    /// Folds backend and internal failures into `SERVER_ERROR` so raw storage
    /// errors never reach an RPC caller.
    #[must_use]
    pub fn into_rpc(self) -> Self {
        match self {
            Self::Storage(e) => Self::ServerError {
                message: e.to_string(),
            },
            Self::Internal { message } => Self::ServerError { message },
            other => other,
        }
    }
}

/// Result type alias for cgmon operations.
pub type MonitorResult<T> = Result<T, MonitorError>;
