//! Statistics: filter-matched queues of recent events with running metrics.

pub mod metrics;
mod profile;
mod queue;
mod service;

pub use metrics::{MetricKind, StatMetric, NOT_AVAILABLE, NOT_AVAILABLE_F64};
pub use profile::{MetricWithFilters, StatQueueProfile, NO_THRESHOLDS};
pub use queue::{SqItem, StatQueue};
pub use service::StatService;
