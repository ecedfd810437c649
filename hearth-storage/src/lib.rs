//! # In-memory storage backend
//!
//! This backend implements the gateway traits from `hearth-core::storage`
//! over plain ordered maps guarded by a single `tokio::sync::RwLock`.
//!
//! ## Design Decisions
//!
//! ### One lock, real transactions
//!
//! Every write path takes the write half of the lock and performs all of
//! its mutations (version row, current pointer, change-log append) inside
//! one critical section. That is the whole transactional story: a write
//! either fully lands or, if it fails validation, touches nothing. Readers
//! take the read half and therefore always observe a committed snapshot.
//!
//! ### Append-only history
//!
//! Version rows are keyed by `(entity_id, version)` in a `BTreeMap`, which
//! gives `list_versions` an ordered range scan for free. Rows are never
//! updated in place; a delete is one more row (the tombstone) plus a moved
//! current pointer. The change log is a `Vec` whose index encodes the
//! sequence (`sequence == index + 1`), which makes gap-freedom structural
//! rather than something to check.
//!
//! ### Corruption containment
//!
//! `repair_scan` walks every row and reports invariant violations as
//! findings instead of failing fast, so one corrupt row never blocks
//! access to the rest of the store.

mod gate;
mod memory;

pub use gate::WriteGate;
pub use memory::InMemoryGateway;
