//! # cgmon - filter-matched monitoring for real-time charging
//!
//! cgmon keeps three kinds of live state about a stream of charging events:
//!
//! - **Stats**: bounded queues of recent events with running metrics
//!   (ASR, ACD, TCD, ...)
//! - **Resources**: counted units that events reserve and release, with
//!   limits and usage expiry
//! - **Thresholds**: hit counters that run actions when events keep
//!   matching
//!
//! All three share one pipeline: profiles are selected through filter
//! indexes, checked against their filters and activation window, ordered by
//! weight and cut after the first blocker. Each selected instance is then
//! mutated under a per-key lock, persisted according to the store interval,
//! and its update cascaded into thresholds.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cgmon::config::MonitorConfig;
//! use cgmon::rpc::MonitorServices;
//! use cgmon::storage::InMemoryDb;
//! use cgmon::thresholds::LogActionExecutor;
//!
//! let mut cfg = MonitorConfig::default();
//! cfg.stats.enabled = true;
//! let services = MonitorServices::new(&cfg, Arc::new(InMemoryDb::new()), Arc::new(LogActionExecutor))?;
//! let ids = services.call("StatSv1.ProcessEvent", serde_json::json!({
//!     "tenant": "cgrates.org", "id": "ev1", "event": {"Account": "1001", "Usage": "45s"}
//! }))?;
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod event;
pub mod time;

// Storage and matching
pub mod cache;
pub mod config;
pub mod filters;
pub mod guardian;
pub mod storage;

// Engines
pub mod engine;
pub mod resources;
pub mod stats;
pub mod thresholds;

// API surface
pub mod rpc;

#[cfg(feature = "server")]
pub mod logging;

#[cfg(feature = "transport-grpc")]
pub mod transport;

// Re-export primary types at crate root for convenience
pub use cache::Cache;
pub use config::{MonitorConfig, StoreInterval};
pub use error::{MonitorError, MonitorResult, ValidationError};
pub use event::{CgrEvent, TenantId};
pub use filters::{Filter, FilterPredicate, FilterRule, FilterService};
pub use guardian::Guardian;
pub use resources::{Resource, ResourceArgs, ResourceProfile, ResourceService};
pub use rpc::MonitorServices;
pub use stats::{StatQueue, StatQueueProfile, StatService};
pub use storage::{DataDb, DataManager, InMemoryDb, StorageError};
pub use thresholds::{ActionExecutor, Threshold, ThresholdProfile, ThresholdService};
