//! Storage layer for cgmon.
//!
//! Backends implement the small [`DataDb`] key/value contract. The
//! [`DataManager`] sits on top: typed records, the shared cache, and filter
//! index maintenance.

pub mod codec;
pub mod keys;
mod manager;
mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use manager::DataManager;
pub use memory::InMemoryDb;
pub use traits::{DataDb, StorageError};
