//! The tool dispatcher.
//!
//! A fixed catalog of twelve named graph operations. The dispatcher
//! validates arguments against each tool's argument struct, routes reads to
//! the graph index and writes through the gateway, and always answers with
//! the uniform `{ success, result | error }` envelope.
//!
//! The same dispatcher runs server-side behind the HTTP API and
//! client-side against the local replica; the only difference is the
//! [`WriteSink`] a write flows into afterwards (the client's sink feeds the
//! outbound sync queue).

mod handlers;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use hearth_core::dto::ToolResponse;
use hearth_core::models::{Entity, EntityType, LoggedChange, NodeId, Relationship, UserId};
use hearth_core::storage::{Gateway, StorageError};
use hearth_storage::WriteGate;

use crate::index::GraphIndex;

pub use handlers::TOOL_NAMES;

/// Who is invoking a tool. The core accepts an already-identified
/// principal; authentication happened upstream.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub user_id: UserId,
    pub node_id: NodeId,
}

/// Where committed writes flow after the store and index accepted them.
///
/// The server's sink is a no-op (the change log already has the record);
/// a client's sink enqueues the change for the next sync cycle.
#[async_trait]
pub trait WriteSink: Send + Sync {
    async fn change_committed(&self, change: &LoggedChange);

    async fn relationship_committed(&self, rel: &Relationship);
}

/// Sink for the server side, where the change log is the source of truth.
#[derive(Default)]
pub struct NullSink;

#[async_trait]
impl WriteSink for NullSink {
    async fn change_committed(&self, _change: &LoggedChange) {}

    async fn relationship_committed(&self, _rel: &Relationship) {}
}

#[derive(thiserror::Error, Debug)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    Schema(String),
    #[error("{0} `{1}` not found")]
    NotFound(&'static str, String),
    #[error("entity `{id}` is a {actual}, not a {expected}")]
    WrongEntityType { id: String, expected: EntityType, actual: EntityType },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ToolError {
    /// Stable machine-readable error kind for the envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::Schema(_) => "schema_error",
            ToolError::NotFound(..) => "not_found",
            ToolError::WrongEntityType { .. } => "wrong_entity_type",
            ToolError::Storage(StorageError::NotFound(..)) => "not_found",
            ToolError::Storage(StorageError::DuplicateVersion { .. }) => "duplicate_version",
            ToolError::Storage(StorageError::ParentMismatch { .. }) => "parent_mismatch",
            ToolError::Storage(StorageError::Corruption(_)) => "corruption",
            ToolError::Storage(StorageError::Unexpected(_)) => "storage_error",
        }
    }
}

/// Description of one catalog entry, served by the tool listing endpoint.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub schema: Value,
}

/// Routes tool calls over a gateway/index pair.
///
/// Reads hit the index only. Writes serialize through the per-id
/// [`WriteGate`], commit to the gateway, refresh the index and then notify
/// the sink, in that order.
pub struct ToolDispatcher {
    gateway: Arc<dyn Gateway>,
    index: GraphIndex,
    gate: Arc<WriteGate>,
    sink: Arc<dyn WriteSink>,
}

impl ToolDispatcher {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        index: GraphIndex,
        gate: Arc<WriteGate>,
        sink: Arc<dyn WriteSink>,
    ) -> Self {
        ToolDispatcher { gateway, index, gate, sink }
    }

    /// Invokes `name` with raw JSON arguments.
    pub async fn dispatch(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolResponse {
        debug!(tool = name, user_id = %ctx.user_id, "dispatching tool call");
        match self.route(name, args, ctx).await {
            Ok(result) => ToolResponse::ok(result),
            Err(err) => {
                warn!(tool = name, kind = err.kind(), error = %err, "tool call failed");
                ToolResponse::err(err.kind(), err.to_string())
            }
        }
    }

    pub fn is_known_tool(name: &str) -> bool {
        TOOL_NAMES.contains(&name)
    }

    fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
        serde_json::from_value(args).map_err(|e| ToolError::Schema(e.to_string()))
    }

    /// The entity must exist, be live, and have the expected type.
    async fn require_typed(&self, id: &str, expected: EntityType) -> Result<Entity, ToolError> {
        let entity = self
            .index
            .get(id)
            .await
            .ok_or_else(|| ToolError::NotFound("entity", id.to_owned()))?;
        if entity.entity_type != expected {
            return Err(ToolError::WrongEntityType {
                id: id.to_owned(),
                expected,
                actual: entity.entity_type,
            });
        }
        Ok(entity)
    }

    /// Write-path tail shared by the mutating tools: commit under the
    /// per-id gate, fold into the index, hand to the sink.
    async fn commit_entity(
        &self,
        new: hearth_core::storage::NewVersion,
    ) -> Result<LoggedChange, ToolError> {
        let _guard = self.gate.acquire(&new.entity.id).await;
        self.commit_entity_in_gate(new).await
    }

    /// Same tail for callers that already hold the id's gate.
    async fn commit_entity_in_gate(
        &self,
        new: hearth_core::storage::NewVersion,
    ) -> Result<LoggedChange, ToolError> {
        let logged = self.gateway.commit(new.clone()).await?;
        self.index.apply_entity(&new.entity).await;
        self.sink.change_committed(&logged).await;
        Ok(logged)
    }

    async fn commit_relationship(&self, rel: Relationship) -> Result<(), ToolError> {
        self.gateway.put_relationship(rel.clone()).await?;
        self.index.apply_relationship(&rel).await;
        self.sink.relationship_committed(&rel).await;
        Ok(())
    }

    /// The catalog as served by the listing endpoint.
    pub fn catalog() -> Vec<ToolSpec> {
        handlers::catalog()
    }

    pub fn catalog_json() -> Value {
        json!({ "tools": Self::catalog() })
    }
}
