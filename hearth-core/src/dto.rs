//! Inbetweenies wire messages and the tool envelope.
//!
//! Transport-agnostic JSON shapes exchanged between a replica and the
//! server. The sync pair travels over `POST /sync`; tool calls answer with
//! the uniform `{ success, result | error }` envelope.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::Display;
use utoipa::ToSchema;

use crate::models::{ChangeRecord, EntityId, NodeId, UserId};

/// Protocol identifier carried by every request. Unknown versions are
/// rejected before any record is applied.
pub const PROTOCOL_VERSION: &str = "inbetweenies-v2";

/// Default cap on records per sync batch, both directions.
pub const MAX_BATCH_RECORDS: usize = 1000;

/// Default cap on the serialized size of a sync batch, both directions.
pub const MAX_BATCH_BYTES: usize = 10 * 1024 * 1024;

/// Client → server sync message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SyncRequest {
    pub protocol_version: String,
    pub node_id: NodeId,
    pub user_id: UserId,
    /// Last sequence the client has fully ingested.
    pub since_sequence: u64,
    /// Optional per-node high-water marks, informational.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub vector: HashMap<NodeId, u64>,
    /// Outbound local changes, bounded by the batch caps.
    #[serde(default)]
    pub changes: Vec<ChangeRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

impl SyncRequest {
    pub fn new(node_id: impl Into<NodeId>, user_id: impl Into<UserId>, since_sequence: u64) -> Self {
        SyncRequest {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            node_id: node_id.into(),
            user_id: user_id.into(),
            since_sequence,
            vector: HashMap::new(),
            changes: Vec::new(),
            capabilities: Vec::new(),
        }
    }
}

/// Server → client sync message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SyncResponse {
    pub server_time: DateTime<Utc>,
    /// Server changes the client lacks, in change-log order.
    pub changes: Vec<ChangeRecord>,
    /// Divergences detected while applying the request's changes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ConflictNotice>,
    /// Inbound records that were already present and silently ignored.
    #[serde(default)]
    pub duplicates: u64,
    /// Sequence the client should advance its cursor to once every record
    /// in `changes` is durably applied.
    pub next_sequence: u64,
    /// Per-origin high-water marks of the server's change log.
    #[serde(default)]
    pub vector: HashMap<NodeId, u64>,
}

/// How the server settled one divergent entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, ToSchema)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConflictDecision {
    /// The version sent by the syncing node won.
    AcceptedRemote,
    /// The version already on the receiving side won.
    KeptLocal,
    /// A merge version parented on both was created.
    Merged,
}

/// One entry of [`SyncResponse::conflicts`]. `local_version` is the version
/// the syncing node sent; `server_version` is what the server held when the
/// divergence was detected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ConflictNotice {
    pub entity_id: EntityId,
    pub local_version: String,
    pub server_version: String,
    pub decision: ConflictDecision,
}

/// Uniform tool-call envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ToolResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorBody>,
}

impl ToolResponse {
    pub fn ok(result: Value) -> Self {
        ToolResponse { success: true, result: Some(result), error: None }
    }

    pub fn err(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ToolResponse {
            success: false,
            result: None,
            error: Some(ToolErrorBody {
                kind: kind.into(),
                message: message.into(),
                details: None,
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ToolErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<Value>,
}
