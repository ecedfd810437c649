//! The authoritative node.
//!
//! Owns the change-log sequence, applies inbound sync batches under the
//! per-entity write gate, and serves the HTTP surface: the Inbetweenies
//! sync endpoint, the tool catalog and convenience entity reads.

pub mod services;
pub mod sync;

pub use services::ServicesBuilder;
pub use sync::{SyncEngine, SyncError};
