use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{Display, EnumIter, EnumString};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::version::format_version;

use super::{EntityId, UserId};

/// Closed set of entity kinds in the home graph.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntityType {
    Home,
    Room,
    Device,
    Zone,
    Door,
    Window,
    Procedure,
    Manual,
    Note,
    Schedule,
    Automation,
    App,
}

/// Where a version came from. Informational only; never consulted by the
/// resolver or the sync engine.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SourceType {
    #[default]
    Manual,
    Homekit,
    Imported,
    Generated,
}

/// One immutable revision of an entity.
///
/// An entity id is stable across revisions; each write produces a fresh
/// `version` row and moves the store's current pointer. Rows are never
/// mutated after commit.
///
/// `parent_versions` is empty for a genesis row, carries one element for a
/// normal update and several for a merge resolution. Deletion is a tombstone
/// row: empty content plus the `tombstone` flag, so that an empty-content
/// live entity stays distinguishable from a deleted one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Entity {
    pub id: EntityId,
    pub version: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub name: String,
    #[schema(value_type = Object)]
    pub content: Map<String, Value>,
    #[serde(default)]
    pub parent_versions: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tombstone: bool,
    pub user_id: UserId,
    #[serde(default)]
    pub source_type: SourceType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Mints a genesis version with a fresh id.
    pub fn genesis(
        entity_type: EntityType,
        name: impl Into<String>,
        content: Map<String, Value>,
        user_id: impl Into<UserId>,
        source_type: SourceType,
        at: DateTime<Utc>,
    ) -> Self {
        let user_id = user_id.into();
        Entity {
            id: Uuid::new_v4().to_string(),
            version: format_version(at, &user_id),
            entity_type,
            name: name.into(),
            content,
            parent_versions: Vec::new(),
            tombstone: false,
            user_id,
            source_type,
            created_at: at,
            updated_at: at,
        }
    }

    /// Derives the successor revision of this one, parented on it.
    pub fn next_version(
        &self,
        name: Option<String>,
        content: Map<String, Value>,
        user_id: impl Into<UserId>,
        at: DateTime<Utc>,
    ) -> Self {
        let user_id = user_id.into();
        Entity {
            id: self.id.clone(),
            version: format_version(at, &user_id),
            entity_type: self.entity_type,
            name: name.unwrap_or_else(|| self.name.clone()),
            content,
            parent_versions: vec![self.version.clone()],
            tombstone: false,
            user_id,
            source_type: self.source_type,
            created_at: self.created_at,
            updated_at: at,
        }
    }

    /// Derives the tombstone revision marking this entity deleted.
    pub fn tombstone_version(&self, user_id: impl Into<UserId>, at: DateTime<Utc>) -> Self {
        let user_id = user_id.into();
        Entity {
            id: self.id.clone(),
            version: format_version(at, &user_id),
            entity_type: self.entity_type,
            name: self.name.clone(),
            content: Map::new(),
            parent_versions: vec![self.version.clone()],
            tombstone: true,
            user_id,
            source_type: self.source_type,
            created_at: self.created_at,
            updated_at: at,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.parent_versions.is_empty()
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {:?} @ {}", self.entity_type, self.name, self.version)
    }
}
