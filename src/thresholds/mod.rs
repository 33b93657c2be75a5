//! Thresholds: hit counters that run actions when events keep matching.
//!
//! Stats and resources push their updates here through the
//! [`ThresholdProcessor`] capability, so neither depends on this service
//! directly.

mod actions;
mod service;
mod threshold;

use serde::{Deserialize, Serialize};

use crate::error::MonitorResult;
use crate::event::CgrEvent;

pub use actions::{ActionExecutor, LogActionExecutor};
pub use service::ThresholdService;
pub use threshold::{Threshold, ThresholdProfile};

/// An event for thresholds, optionally restricted to explicit ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdEventArgs {
    /// `None` selects thresholds through the filter indexes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_ids: Option<Vec<String>>,
    #[serde(flatten)]
    pub event: CgrEvent,
}

impl ThresholdEventArgs {
    #[must_use]
    pub const fn new(event: CgrEvent) -> Self {
        Self {
            threshold_ids: None,
            event,
        }
    }
}

/// Receives cascaded events.
pub trait ThresholdProcessor: Send + Sync {
    /// Returns the ids of the thresholds hit.
    ///
    /// # Errors
    ///
    /// `NotFound` when nothing matched; anything else is a real failure.
    fn process_event(&self, args: ThresholdEventArgs) -> MonitorResult<Vec<String>>;
}
