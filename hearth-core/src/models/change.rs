use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{Display, EnumString};
use utoipa::ToSchema;

use crate::version::parse_version;

use super::{Entity, EntityId, EntityType, NodeId, SourceType, UserId};

/// What a change record did to its entity.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// One mutation, in the shape it travels over the wire.
///
/// Creates and updates carry the full entity state (`name`, `content`);
/// deletes carry `null` content. `timestamp` is the author-side revision
/// time embedded in `version` and is what last-write-wins compares, never
/// the arrival time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub entity_id: EntityId,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_version: Option<String>,
    #[serde(default)]
    pub parent_versions: Vec<String>,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub name: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub content: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<SourceType>,
    pub user_id: UserId,
    pub origin_node_id: NodeId,
    pub timestamp: DateTime<Utc>,
}

impl ChangeRecord {
    /// Builds the record describing a committed entity version.
    pub fn from_entity(
        kind: ChangeKind,
        entity: &Entity,
        origin_node_id: impl Into<NodeId>,
    ) -> Self {
        // Deletes null the content but keep the name, so replicas that
        // materialize the tombstone from the record alone still agree with
        // the author's row byte for byte.
        let content = match kind {
            ChangeKind::Delete => None,
            ChangeKind::Create | ChangeKind::Update => Some(entity.content.clone()),
        };
        ChangeRecord {
            kind,
            entity_id: entity.id.clone(),
            version: entity.version.clone(),
            prior_version: entity.parent_versions.first().cloned(),
            parent_versions: entity.parent_versions.clone(),
            entity_type: entity.entity_type,
            name: Some(entity.name.clone()),
            content,
            source_type: Some(entity.source_type),
            user_id: entity.user_id.clone(),
            origin_node_id: origin_node_id.into(),
            timestamp: entity.updated_at,
        }
    }

    /// Materializes the entity version this record describes.
    ///
    /// `created_at` is the receiver's knowledge of when the entity id first
    /// appeared; updates applied on top of an existing entity keep its
    /// original creation time, otherwise the record's own timestamp is used.
    pub fn to_entity(&self, created_at: Option<DateTime<Utc>>) -> Entity {
        Entity {
            id: self.entity_id.clone(),
            version: self.version.clone(),
            entity_type: self.entity_type,
            name: self.name.clone().unwrap_or_default(),
            content: self.content.clone().unwrap_or_default(),
            parent_versions: self.parent_versions.clone(),
            tombstone: self.kind == ChangeKind::Delete,
            user_id: self.user_id.clone(),
            source_type: self.source_type.unwrap_or_default(),
            created_at: created_at.unwrap_or(self.timestamp),
            updated_at: self.timestamp,
        }
    }

    /// Whether the record's timestamp matches the one embedded in its
    /// version string. Cheap sanity check used by the repair scan.
    pub fn timestamp_consistent(&self) -> bool {
        parse_version(&self.version)
            .map(|(ts, _)| ts == self.timestamp)
            .unwrap_or(false)
    }
}

/// A change record as stored in a node's append-only log, stamped with that
/// node's strictly increasing sequence number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoggedChange {
    pub sequence: u64,
    #[serde(flatten)]
    pub record: ChangeRecord,
}
