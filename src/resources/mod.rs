//! Resources: counted units that events reserve and give back.

mod resource;
mod service;

use serde::{Deserialize, Serialize};

use crate::event::CgrEvent;

pub use resource::{Resource, ResourceProfile, ResourceUsage};
pub use service::ResourceService;

const fn default_units() -> f64 {
    1.0
}

/// An allocation request: the event selecting resources plus the usage it
/// books.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceArgs {
    #[serde(flatten)]
    pub event: CgrEvent,
    #[serde(default)]
    pub usage_id: String,
    #[serde(default = "default_units")]
    pub units: f64,
}

impl ResourceArgs {
    #[must_use]
    pub fn new(event: CgrEvent, usage_id: impl Into<String>, units: f64) -> Self {
        Self {
            event,
            usage_id: usage_id.into(),
            units,
        }
    }

    /// Mandatory fields that are absent, event fields first.
    #[must_use]
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = self.event.missing_fields();
        if self.usage_id.is_empty() {
            missing.push("UsageID");
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units_default_to_one() {
        let args: ResourceArgs =
            serde_json::from_str(r#"{"tenant":"cgrates.org","id":"e1","event":{"Account":"1001"},"usage_id":"u1"}"#)
                .unwrap();
        assert_eq!(args.units, 1.0);
        assert!(args.missing_fields().is_empty());
    }

    #[test]
    fn test_missing_fields_include_usage_id() {
        let args = ResourceArgs::new(CgrEvent::new("cgrates.org", ""), "", 1.0);
        assert_eq!(args.missing_fields(), vec!["ID", "Event", "UsageID"]);
    }
}
