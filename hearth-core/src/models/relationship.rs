use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{Display, EnumString};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{EntityId, UserId};

/// Closed set of edge kinds between entities.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RelationshipType {
    LocatedIn,
    Controls,
    ConnectsTo,
    PartOf,
    Manages,
    DocumentedBy,
    ProcedureFor,
    TriggeredBy,
    DependsOn,
    HasBlob,
    ControlledByApp,
}

/// A directed edge between two entities.
///
/// Endpoints reference stable entity ids. `from_version`/`to_version` are
/// `None` by default, meaning the edge follows each endpoint's current
/// version; a pinned version is preserved for provenance reads but traversal
/// always resolves through the current pointer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Relationship {
    pub id: String,
    pub from_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_version: Option<String>,
    pub to_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_version: Option<String>,
    #[serde(rename = "type")]
    pub relationship_type: RelationshipType,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub properties: Map<String, Value>,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        from_id: impl Into<EntityId>,
        to_id: impl Into<EntityId>,
        relationship_type: RelationshipType,
        properties: Map<String, Value>,
        user_id: impl Into<UserId>,
        at: DateTime<Utc>,
    ) -> Self {
        Relationship {
            id: Uuid::new_v4().to_string(),
            from_id: from_id.into(),
            from_version: None,
            to_id: to_id.into(),
            to_version: None,
            relationship_type,
            properties,
            user_id: user_id.into(),
            created_at: at,
            updated_at: at,
        }
    }

    /// The opposite endpoint, if `entity_id` is one of the two.
    pub fn other_endpoint(&self, entity_id: &str) -> Option<&EntityId> {
        if self.from_id == entity_id {
            Some(&self.to_id)
        } else if self.to_id == entity_id {
            Some(&self.from_id)
        } else {
            None
        }
    }

    pub fn touches(&self, entity_id: &str) -> bool {
        self.from_id == entity_id || self.to_id == entity_id
    }
}
