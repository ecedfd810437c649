//! Core types for the Hearth smart-home knowledge graph.
//!
//! This crate holds everything both sides of the sync protocol agree on:
//! the versioned entity/relationship models, the change-log record shape,
//! the Inbetweenies wire messages, the storage gateway traits and the
//! conflict resolver. It contains no IO of its own.

pub mod dto;
pub mod models;
pub mod resolver;
pub mod storage;
pub mod version;

pub use models::{
    ChangeKind, ChangeRecord, Entity, EntityId, EntityType, LoggedChange, NodeId, Relationship,
    RelationshipType, SourceType, UserId,
};
pub use resolver::{Resolution, Resolver};
pub use storage::StorageError;
