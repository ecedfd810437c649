//! The twelve catalog operations.
//!
//! One argument struct per tool, `deny_unknown_fields` so stray arguments
//! surface as schema errors instead of being silently dropped, and one
//! handler method each. `route` is the single entry point the dispatcher
//! calls after resolving the tool name.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use hearth_core::models::{Entity, EntityType, Relationship, RelationshipType, SourceType};
use hearth_core::storage::NewVersion;

use super::{ToolContext, ToolDispatcher, ToolError, ToolSpec};

pub const TOOL_NAMES: [&str; 12] = [
    "get_devices_in_room",
    "find_device_controls",
    "get_room_connections",
    "search_entities",
    "create_entity",
    "create_relationship",
    "find_path",
    "get_entity_details",
    "find_similar_entities",
    "get_procedures_for_device",
    "get_automations_in_room",
    "update_entity",
];

const DEFAULT_SEARCH_LIMIT: usize = 10;
const MAX_SEARCH_LIMIT: usize = 100;
const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.1;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RoomArgs {
    room_id: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceArgs {
    device_id: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchArgs {
    query: String,
    entity_types: Option<Vec<EntityType>>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateEntityArgs {
    #[serde(rename = "type")]
    entity_type: EntityType,
    name: String,
    #[serde(default)]
    content: Map<String, Value>,
    source_type: Option<SourceType>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateRelationshipArgs {
    from_id: String,
    to_id: String,
    #[serde(rename = "type")]
    relationship_type: RelationshipType,
    #[serde(default)]
    properties: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FindPathArgs {
    from_id: String,
    to_id: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EntityArgs {
    entity_id: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SimilarArgs {
    entity_id: String,
    threshold: Option<f64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateEntityArgs {
    entity_id: String,
    changes: UpdateChanges,
    /// Author of the new version; defaults to the calling principal.
    user_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateChanges {
    name: Option<String>,
    /// Key-wise overlay onto the current content.
    content: Option<Map<String, Value>>,
}

fn entities_json(entities: &[Entity]) -> Value {
    Value::Array(
        entities
            .iter()
            .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
            .collect(),
    )
}

fn relationships_json(rels: &[Relationship]) -> Value {
    Value::Array(
        rels.iter()
            .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
            .collect(),
    )
}

impl ToolDispatcher {
    pub(super) async fn route(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        match name {
            "get_devices_in_room" => self.get_devices_in_room(Self::parse_args(args)?).await,
            "find_device_controls" => self.find_device_controls(Self::parse_args(args)?).await,
            "get_room_connections" => self.get_room_connections(Self::parse_args(args)?).await,
            "search_entities" => self.search_entities(Self::parse_args(args)?).await,
            "create_entity" => self.create_entity(Self::parse_args(args)?, ctx).await,
            "create_relationship" => {
                self.create_relationship(Self::parse_args(args)?, ctx)
                    .await
            }
            "find_path" => self.find_path(Self::parse_args(args)?).await,
            "get_entity_details" => self.get_entity_details(Self::parse_args(args)?).await,
            "find_similar_entities" => {
                self.find_similar_entities(Self::parse_args(args)?)
                    .await
            }
            "get_procedures_for_device" => {
                self.get_procedures_for_device(Self::parse_args(args)?)
                    .await
            }
            "get_automations_in_room" => {
                self.get_automations_in_room(Self::parse_args(args)?)
                    .await
            }
            "update_entity" => self.update_entity(Self::parse_args(args)?, ctx).await,
            other => Err(ToolError::UnknownTool(other.to_owned())),
        }
    }

    async fn get_devices_in_room(&self, args: RoomArgs) -> Result<Value, ToolError> {
        self.require_typed(&args.room_id, EntityType::Room)
            .await?;
        let mut devices: Vec<Entity> = self
            .index
            .neighbors(&args.room_id)
            .await
            .into_iter()
            .filter(|(rel, other)| {
                rel.relationship_type == RelationshipType::LocatedIn
                    && other.entity_type == EntityType::Device
            })
            .map(|(_, other)| other)
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices.dedup_by(|a, b| a.id == b.id);
        Ok(json!({ "room_id": args.room_id, "devices": entities_json(&devices) }))
    }

    async fn find_device_controls(&self, args: DeviceArgs) -> Result<Value, ToolError> {
        self.require_typed(&args.device_id, EntityType::Device)
            .await?;
        let mut rels: Vec<Relationship> = self
            .index
            .relationships_of(&args.device_id)
            .await
            .into_iter()
            .filter(|r| {
                matches!(
                    r.relationship_type,
                    RelationshipType::Controls | RelationshipType::ControlledByApp
                )
            })
            .collect();
        rels.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(json!({ "device_id": args.device_id, "relationships": relationships_json(&rels) }))
    }

    /// Rooms reachable from this one either directly (CONNECTS_TO) or in
    /// one hop through a door or window entity.
    async fn get_room_connections(&self, args: RoomArgs) -> Result<Value, ToolError> {
        self.require_typed(&args.room_id, EntityType::Room)
            .await?;
        // Only CONNECTS_TO edges express a physical connection; a door
        // merely LOCATED_IN a room does not join that room to anything.
        let mut rooms: Vec<Entity> = Vec::new();
        for (rel, other) in self.index.neighbors(&args.room_id).await {
            if rel.relationship_type != RelationshipType::ConnectsTo {
                continue;
            }
            match other.entity_type {
                EntityType::Room => rooms.push(other),
                EntityType::Door | EntityType::Window => {
                    for (rel2, far) in self.index.neighbors(&other.id).await {
                        if far.entity_type == EntityType::Room
                            && far.id != args.room_id
                            && rel2.relationship_type == RelationshipType::ConnectsTo
                        {
                            rooms.push(far);
                        }
                    }
                }
                _ => {}
            }
        }
        rooms.sort_by(|a, b| a.id.cmp(&b.id));
        rooms.dedup_by(|a, b| a.id == b.id);
        Ok(json!({ "room_id": args.room_id, "rooms": entities_json(&rooms) }))
    }

    async fn search_entities(&self, args: SearchArgs) -> Result<Value, ToolError> {
        let limit = args
            .limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .min(MAX_SEARCH_LIMIT);
        let hits = self
            .index
            .search(&args.query, args.entity_types.as_deref(), limit)
            .await;
        let results: Vec<Value> = hits
            .into_iter()
            .map(|(entity, score)| json!({ "entity": entity, "score": score }))
            .collect();
        Ok(json!({ "query": args.query, "count": results.len(), "results": results }))
    }

    async fn create_entity(
        &self,
        args: CreateEntityArgs,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let entity = Entity::genesis(
            args.entity_type,
            args.name,
            args.content,
            ctx.user_id.clone(),
            args.source_type.unwrap_or_default(),
            Utc::now(),
        );
        self.commit_entity(NewVersion::create(entity.clone(), ctx.node_id.clone()))
            .await?;
        Ok(json!({ "entity": entity }))
    }

    async fn create_relationship(
        &self,
        args: CreateRelationshipArgs,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let rel = Relationship::new(
            args.from_id,
            args.to_id,
            args.relationship_type,
            args.properties,
            ctx.user_id.clone(),
            Utc::now(),
        );
        self.commit_relationship(rel.clone()).await?;
        Ok(json!({ "relationship": rel }))
    }

    async fn find_path(&self, args: FindPathArgs) -> Result<Value, ToolError> {
        let path = self.index.find_path(&args.from_id, &args.to_id).await;
        Ok(json!({
            "from": args.from_id,
            "to": args.to_id,
            "found": path.is_some(),
            "path": path,
        }))
    }

    async fn get_entity_details(&self, args: EntityArgs) -> Result<Value, ToolError> {
        // Details are served from the store, not the index, so history of a
        // tombstoned entity stays inspectable.
        let entity = self
            .gateway
            .get_current(&args.entity_id)
            .await?
            .ok_or_else(|| ToolError::NotFound("entity", args.entity_id.clone()))?;
        let mut rels = self.gateway.relationships_of(&args.entity_id).await?;
        rels.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(json!({ "entity": entity, "relationships": relationships_json(&rels) }))
    }

    async fn find_similar_entities(&self, args: SimilarArgs) -> Result<Value, ToolError> {
        let threshold = args.threshold.unwrap_or(DEFAULT_SIMILARITY_THRESHOLD);
        let results = self
            .index
            .find_similar(&args.entity_id, threshold)
            .await
            .ok_or_else(|| ToolError::NotFound("entity", args.entity_id.clone()))?;
        let results: Vec<Value> = results
            .into_iter()
            .map(|(entity, similarity)| json!({ "entity": entity, "similarity": similarity }))
            .collect();
        Ok(json!({ "entity_id": args.entity_id, "results": results }))
    }

    async fn get_procedures_for_device(&self, args: DeviceArgs) -> Result<Value, ToolError> {
        self.require_typed(&args.device_id, EntityType::Device)
            .await?;
        let mut procedures: Vec<Entity> = self
            .index
            .neighbors(&args.device_id)
            .await
            .into_iter()
            .filter(|(rel, other)| {
                rel.relationship_type == RelationshipType::ProcedureFor
                    && other.entity_type == EntityType::Procedure
            })
            .map(|(_, other)| other)
            .collect();
        procedures.sort_by(|a, b| a.id.cmp(&b.id));
        procedures.dedup_by(|a, b| a.id == b.id);
        Ok(json!({ "device_id": args.device_id, "procedures": entities_json(&procedures) }))
    }

    async fn get_automations_in_room(&self, args: RoomArgs) -> Result<Value, ToolError> {
        self.require_typed(&args.room_id, EntityType::Room)
            .await?;
        let mut automations: Vec<Entity> = self
            .index
            .neighbors(&args.room_id)
            .await
            .into_iter()
            .filter(|(rel, other)| {
                other.entity_type == EntityType::Automation
                    && matches!(
                        rel.relationship_type,
                        RelationshipType::TriggeredBy | RelationshipType::LocatedIn
                    )
            })
            .map(|(_, other)| other)
            .collect();
        automations.sort_by(|a, b| a.id.cmp(&b.id));
        automations.dedup_by(|a, b| a.id == b.id);
        Ok(json!({ "room_id": args.room_id, "automations": entities_json(&automations) }))
    }

    async fn update_entity(
        &self,
        args: UpdateEntityArgs,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        // Read the current version inside the gate so a concurrent update
        // cannot slip a new current in between the read and the commit.
        let _guard = self.gate.acquire(&args.entity_id).await;
        let current = self
            .gateway
            .get_current(&args.entity_id)
            .await?
            .filter(|e| !e.tombstone)
            .ok_or_else(|| ToolError::NotFound("entity", args.entity_id.clone()))?;

        let mut content = current.content.clone();
        if let Some(overlay) = args.changes.content {
            for (k, v) in overlay {
                content.insert(k, v);
            }
        }
        let user_id = args.user_id.unwrap_or_else(|| ctx.user_id.clone());
        let next = current.next_version(args.changes.name, content, user_id, Utc::now());
        self.commit_entity_in_gate(NewVersion::update(next.clone(), ctx.node_id.clone()))
            .await?;
        Ok(json!({ "entity": next }))
    }
}

/// Catalog metadata: names, human descriptions, JSON argument schemas.
pub(super) fn catalog() -> Vec<ToolSpec> {
    fn object(properties: Value, required: &[&str]) -> Value {
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    vec![
        ToolSpec {
            name: "get_devices_in_room",
            description: "List device entities located in a room",
            schema: object(json!({ "room_id": { "type": "string" } }), &["room_id"]),
        },
        ToolSpec {
            name: "find_device_controls",
            description: "List control relationships of a device",
            schema: object(json!({ "device_id": { "type": "string" } }), &["device_id"]),
        },
        ToolSpec {
            name: "get_room_connections",
            description: "Rooms connected to a room via doors, windows or direct connections",
            schema: object(json!({ "room_id": { "type": "string" } }), &["room_id"]),
        },
        ToolSpec {
            name: "search_entities",
            description: "Ranked token search over entity names and content",
            schema: object(
                json!({
                    "query": { "type": "string" },
                    "entity_types": { "type": "array", "items": { "type": "string" } },
                    "limit": { "type": "integer", "minimum": 1, "maximum": MAX_SEARCH_LIMIT },
                }),
                &["query"],
            ),
        },
        ToolSpec {
            name: "create_entity",
            description: "Create a new entity (genesis version)",
            schema: object(
                json!({
                    "type": { "type": "string" },
                    "name": { "type": "string" },
                    "content": { "type": "object" },
                    "source_type": { "type": "string" },
                }),
                &["type", "name"],
            ),
        },
        ToolSpec {
            name: "create_relationship",
            description: "Create a relationship between two entities",
            schema: object(
                json!({
                    "from_id": { "type": "string" },
                    "to_id": { "type": "string" },
                    "type": { "type": "string" },
                    "properties": { "type": "object" },
                }),
                &["from_id", "to_id", "type"],
            ),
        },
        ToolSpec {
            name: "find_path",
            description: "Shortest path between two entities over live relationships",
            schema: object(
                json!({
                    "from_id": { "type": "string" },
                    "to_id": { "type": "string" },
                }),
                &["from_id", "to_id"],
            ),
        },
        ToolSpec {
            name: "get_entity_details",
            description: "An entity's current version plus all of its relationships",
            schema: object(json!({ "entity_id": { "type": "string" } }), &["entity_id"]),
        },
        ToolSpec {
            name: "find_similar_entities",
            description: "Entities ranked by token-set similarity to a reference entity",
            schema: object(
                json!({
                    "entity_id": { "type": "string" },
                    "threshold": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
                }),
                &["entity_id"],
            ),
        },
        ToolSpec {
            name: "get_procedures_for_device",
            description: "Procedure entities attached to a device",
            schema: object(json!({ "device_id": { "type": "string" } }), &["device_id"]),
        },
        ToolSpec {
            name: "get_automations_in_room",
            description: "Automation entities triggered by or located in a room",
            schema: object(json!({ "room_id": { "type": "string" } }), &["room_id"]),
        },
        ToolSpec {
            name: "update_entity",
            description: "Write a new version of an entity, parented on its current version",
            schema: object(
                json!({
                    "entity_id": { "type": "string" },
                    "changes": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "content": { "type": "object" },
                        },
                        "additionalProperties": false,
                    },
                    "user_id": { "type": "string" },
                }),
                &["entity_id", "changes"],
            ),
        },
    ]
}
