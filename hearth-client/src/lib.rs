//! Client replica of the Hearth graph.
//!
//! A replica keeps a full local copy of the graph (same store, same index,
//! same tool dispatcher as the server) and exchanges changes with the
//! authoritative node through the Inbetweenies protocol. Local writes land
//! locally first and queue for the next sync cycle, so the replica is fully
//! usable offline; the [`coordinator`] gates outbound sync and tracks
//! connection health, and [`sync`] drives the cycle state machine.

pub mod coordinator;
pub mod sync;
pub mod transport;

pub use coordinator::{ConnectionHealth, CoordinatorSink, ReplicaCoordinator};
pub use sync::{CancelHandle, ClientSyncError, CycleReport, SyncClient, SyncState};
pub use transport::{HttpTransport, SyncTransport, TransportError};
