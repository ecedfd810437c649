//! Storage gateway traits and the error taxonomy.
//!
//! The core only ever talks to persistence through these traits. Any
//! backend with transactional writes and range scans can implement them;
//! the workspace ships an in-memory gateway in `hearth-storage`.
//!
//! ## Atomicity contract
//!
//! [`EntityGateway::commit`] must apply the version row, the current
//! pointer swap and the change-log append as one unit: a reader never sees
//! a version without its log record or a moved pointer without its version.
//! Implementations are free to realize that with a database transaction or
//! with a single writer lock, but partial application is never observable.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{
    ChangeKind, Entity, EntityId, EntityType, LoggedChange, NodeId, Relationship,
};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum StorageError {
    #[error("could not find {0} with id `{1}`")]
    NotFound(&'static str, String),
    #[error("version `{version}` of entity `{entity_id}` already exists")]
    DuplicateVersion { entity_id: EntityId, version: String },
    #[error(
        "parents {parents:?} of entity `{entity_id}` do not include current `{current}`"
    )]
    ParentMismatch { entity_id: EntityId, parents: Vec<String>, current: String },
    #[error("storage corruption: {0}")]
    Corruption(String),
    #[error("unexpected storage error: {0}")]
    Unexpected(String),
}

/// A version write staged for commit.
#[derive(Clone, Debug)]
pub struct NewVersion {
    pub entity: Entity,
    pub kind: ChangeKind,
    pub origin_node_id: NodeId,
}

impl NewVersion {
    pub fn create(entity: Entity, origin_node_id: impl Into<NodeId>) -> Self {
        NewVersion { entity, kind: ChangeKind::Create, origin_node_id: origin_node_id.into() }
    }

    pub fn update(entity: Entity, origin_node_id: impl Into<NodeId>) -> Self {
        NewVersion { entity, kind: ChangeKind::Update, origin_node_id: origin_node_id.into() }
    }

    pub fn delete(entity: Entity, origin_node_id: impl Into<NodeId>) -> Self {
        NewVersion { entity, kind: ChangeKind::Delete, origin_node_id: origin_node_id.into() }
    }
}

/// Outcome of the repair scan: per-row invariant violations, reported
/// without blocking access to healthy rows.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairReport {
    pub rows_scanned: usize,
    pub findings: Vec<String>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Versioned entity persistence.
#[async_trait]
pub trait EntityGateway: Send + Sync {
    /// Appends a version row, moves the current pointer to it and logs the
    /// change, atomically. Fails with [`StorageError::DuplicateVersion`] if
    /// the `(id, version)` row already exists.
    async fn commit(&self, new: NewVersion) -> Result<LoggedChange, StorageError>;

    /// Appends a version row and logs it *without* moving the current
    /// pointer. Used for the losing side of a conflict so history keeps
    /// both competitors.
    async fn commit_superseded(&self, new: NewVersion) -> Result<LoggedChange, StorageError>;

    async fn get_current(&self, id: &str) -> Result<Option<Entity>, StorageError>;

    async fn get_version(&self, id: &str, version: &str) -> Result<Entity, StorageError>;

    async fn list_versions(&self, id: &str) -> Result<Vec<Entity>, StorageError>;

    async fn contains_version(&self, id: &str, version: &str) -> Result<bool, StorageError>;

    /// Current versions of every live (non-tombstoned) entity.
    async fn all_current(&self) -> Result<Vec<Entity>, StorageError>;

    async fn find_by_type(&self, entity_type: EntityType) -> Result<Vec<Entity>, StorageError>;

    /// Case-insensitive substring match over current-version names.
    async fn find_by_name_substring(&self, q: &str) -> Result<Vec<Entity>, StorageError>;

    /// Walks every row checking the store invariants. Corrupt rows are
    /// reported, not fatal.
    async fn repair_scan(&self) -> Result<RepairReport, StorageError>;
}

/// Relationship persistence. Relationships are immutable once written and
/// removed by id.
#[async_trait]
pub trait RelationshipGateway: Send + Sync {
    async fn put_relationship(&self, rel: Relationship) -> Result<(), StorageError>;

    async fn get_relationship(&self, id: &str) -> Result<Relationship, StorageError>;

    /// All relationships touching the entity, either direction.
    async fn relationships_of(&self, entity_id: &str) -> Result<Vec<Relationship>, StorageError>;

    async fn all_relationships(&self) -> Result<Vec<Relationship>, StorageError>;

    async fn delete_relationship(&self, id: &str) -> Result<(), StorageError>;
}

/// Read access to the append-only change log.
#[async_trait]
pub trait ChangeLogGateway: Send + Sync {
    /// Records with `sequence > since_sequence`, in sequence order, at most
    /// `limit` of them.
    async fn scan_changes(
        &self,
        since_sequence: u64,
        limit: usize,
    ) -> Result<Vec<LoggedChange>, StorageError>;

    /// Same, skipping records that originated at `exclude_origin`.
    async fn scan_changes_excluding(
        &self,
        since_sequence: u64,
        limit: usize,
        exclude_origin: &str,
    ) -> Result<Vec<LoggedChange>, StorageError>;

    /// Highest sequence assigned so far; 0 for an empty log.
    async fn head_sequence(&self) -> Result<u64, StorageError>;

    /// Per-origin high-water marks, as reported in sync responses.
    async fn origin_vector(&self) -> Result<HashMap<NodeId, u64>, StorageError>;
}

/// The full gateway the sync engine and tool dispatcher operate over.
pub trait Gateway: EntityGateway + RelationshipGateway + ChangeLogGateway {}

impl<T: EntityGateway + RelationshipGateway + ChangeLogGateway> Gateway for T {}
