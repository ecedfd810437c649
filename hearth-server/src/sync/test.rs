use std::sync::Arc;

use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use serde_json::{json, Map};

use hearth_core::dto::{ConflictDecision, SyncRequest, PROTOCOL_VERSION};
use hearth_core::models::{ChangeKind, ChangeRecord, Entity, EntityType, SourceType};
use hearth_core::resolver::Resolver;
use hearth_core::storage::ChangeLogGateway as _;
use hearth_core::storage::EntityGateway as _;
use hearth_graph::GraphIndex;
use hearth_storage::{InMemoryGateway, WriteGate};

use super::{SyncEngine, SyncError};

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .unwrap()
        .with_timezone(&Utc)
}

fn engine() -> (Arc<InMemoryGateway>, SyncEngine) {
    let gateway = Arc::new(InMemoryGateway::new());
    let engine = SyncEngine::new(
        gateway.clone(),
        GraphIndex::new(),
        Resolver::default(),
        Arc::new(WriteGate::new()),
        "server",
    );
    (gateway, engine)
}

fn kitchen(at: &str) -> Entity {
    let mut content = Map::new();
    content.insert("floor".into(), json!(1));
    Entity::genesis(EntityType::Room, "Kitchen", content, "alice", SourceType::Manual, ts(at))
}

fn floor_update(base: &Entity, user: &str, at: &str, floor: i64) -> Entity {
    let mut content = Map::new();
    content.insert("floor".into(), json!(floor));
    base.next_version(None, content, user, ts(at))
}

fn request(node: &str, since: u64, changes: Vec<ChangeRecord>) -> SyncRequest {
    let mut req = SyncRequest::new(node, "alice", since);
    req.changes = changes;
    req
}

#[tokio::test]
async fn genesis_sync_assigns_sequence_one_and_replays_are_idempotent() {
    let (gateway, engine) = engine();
    let e = kitchen("2024-01-15T10:00:00Z");
    let create = ChangeRecord::from_entity(ChangeKind::Create, &e, "node-a");

    let resp = engine
        .handle_sync(request("node-a", 0, vec![create.clone()]))
        .await
        .unwrap();
    // The only record originated at the caller, so nothing comes back, but
    // the cursor still advances to the head.
    assert_eq!(resp.changes, vec![]);
    assert_eq!(resp.next_sequence, 1);
    assert_eq!(resp.duplicates, 0);
    assert_eq!(gateway.head_sequence().await.unwrap(), 1);
    assert_eq!(gateway.get_current(&e.id).await.unwrap(), Some(e.clone()));

    // Second sync with the same change: counted, not re-applied.
    let resp = engine
        .handle_sync(request("node-a", 1, vec![create]))
        .await
        .unwrap();
    assert_eq!(resp.duplicates, 1);
    assert_eq!(resp.changes, vec![]);
    assert_eq!(resp.next_sequence, 1);
    assert_eq!(gateway.head_sequence().await.unwrap(), 1);
    assert_eq!(resp.vector, std::collections::HashMap::from([("node-a".to_string(), 1)]));
}

#[tokio::test]
async fn second_node_receives_the_create() {
    let (_, engine) = engine();
    let e = kitchen("2024-01-15T10:00:00Z");
    let create = ChangeRecord::from_entity(ChangeKind::Create, &e, "node-a");
    engine
        .handle_sync(request("node-a", 0, vec![create.clone()]))
        .await
        .unwrap();

    let resp = engine
        .handle_sync(request("node-b", 0, vec![]))
        .await
        .unwrap();
    assert_eq!(resp.changes, vec![create]);
    assert_eq!(resp.next_sequence, 1);
}

#[test_log::test(tokio::test)]
async fn lww_divergence_later_writer_wins_and_history_keeps_both() {
    let (gateway, engine) = engine();
    let base = kitchen("2024-01-15T10:00:00Z");
    engine
        .handle_sync(request(
            "node-a",
            0,
            vec![ChangeRecord::from_entity(ChangeKind::Create, &base, "node-a")],
        ))
        .await
        .unwrap();

    let v_a = floor_update(&base, "alice", "2024-01-15T10:05:00.500Z", 2);
    let v_b = floor_update(&base, "bob", "2024-01-15T10:05:00.700Z", 3);

    let resp = engine
        .handle_sync(request(
            "node-a",
            1,
            vec![ChangeRecord::from_entity(ChangeKind::Update, &v_a, "node-a")],
        ))
        .await
        .unwrap();
    assert!(resp.conflicts.is_empty(), "building on current is not a conflict");

    let resp = engine
        .handle_sync(request(
            "node-b",
            1,
            vec![ChangeRecord::from_entity(ChangeKind::Update, &v_b, "node-b")],
        ))
        .await
        .unwrap();

    assert_eq!(resp.conflicts.len(), 1);
    let conflict = &resp.conflicts[0];
    assert_eq!(conflict.entity_id, base.id);
    assert_eq!(conflict.local_version, v_b.version);
    assert_eq!(conflict.server_version, v_a.version);
    assert_eq!(conflict.decision, ConflictDecision::AcceptedRemote);

    // node-b's response already carries the record it lacks: alice's
    // superseded update (the create is below its cursor, its own update is
    // filtered as an echo).
    assert_eq!(
        resp.changes
            .iter()
            .map(|c| c.version.as_str())
            .collect::<Vec<_>>(),
        vec![v_a.version.as_str()]
    );

    let current = gateway.get_current(&base.id).await.unwrap().unwrap();
    assert_eq!(current.version, v_b.version);
    assert_eq!(current.content["floor"], json!(3));
    // Change log contains all three records.
    assert_eq!(gateway.head_sequence().await.unwrap(), 3);
    assert_eq!(gateway.list_versions(&base.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn equal_timestamps_tiebreak_on_user_id() {
    let (gateway, engine) = engine();
    let base = kitchen("2024-01-15T10:00:00Z");
    engine
        .handle_sync(request(
            "node-a",
            0,
            vec![ChangeRecord::from_entity(ChangeKind::Create, &base, "node-a")],
        ))
        .await
        .unwrap();

    let v_alice = floor_update(&base, "alice", "2024-01-15T10:06:00.000Z", 2);
    let v_bob = floor_update(&base, "bob", "2024-01-15T10:06:00.000Z", 3);

    engine
        .handle_sync(request(
            "node-a",
            1,
            vec![ChangeRecord::from_entity(ChangeKind::Update, &v_alice, "node-a")],
        ))
        .await
        .unwrap();
    let resp = engine
        .handle_sync(request(
            "node-b",
            1,
            vec![ChangeRecord::from_entity(ChangeKind::Update, &v_bob, "node-b")],
        ))
        .await
        .unwrap();

    assert_eq!(resp.conflicts[0].decision, ConflictDecision::AcceptedRemote);
    let current = gateway.get_current(&base.id).await.unwrap().unwrap();
    assert_eq!(current.user_id, "bob");
}

#[tokio::test]
async fn tombstone_beats_concurrent_update_within_the_window() {
    let (gateway, engine) = engine();
    let base = kitchen("2024-01-15T10:00:00Z");
    engine
        .handle_sync(request(
            "node-a",
            0,
            vec![ChangeRecord::from_entity(ChangeKind::Create, &base, "node-a")],
        ))
        .await
        .unwrap();

    let dead = base.tombstone_version("alice", ts("2024-01-15T10:07:00.000Z"));
    let edit = floor_update(&base, "bob", "2024-01-15T10:07:00.500Z", 4);

    engine
        .handle_sync(request(
            "node-a",
            1,
            vec![ChangeRecord::from_entity(ChangeKind::Delete, &dead, "node-a")],
        ))
        .await
        .unwrap();
    let resp = engine
        .handle_sync(request(
            "node-b",
            1,
            vec![ChangeRecord::from_entity(ChangeKind::Update, &edit, "node-b")],
        ))
        .await
        .unwrap();

    // bob's edit is 500ms later but the tombstone still wins.
    assert_eq!(resp.conflicts[0].decision, ConflictDecision::KeptLocal);
    let current = gateway.get_current(&base.id).await.unwrap().unwrap();
    assert_eq!(current.version, dead.version);
    assert!(current.tombstone);
}

#[tokio::test]
async fn response_batches_are_capped_and_pageable() {
    let (_, engine) = engine();
    let engine = engine.with_response_caps(2, usize::MAX);

    let mut changes = Vec::new();
    for i in 0..5 {
        let e = kitchen(&format!("2024-01-15T10:00:0{i}Z"));
        changes.push(ChangeRecord::from_entity(ChangeKind::Create, &e, "node-a"));
    }
    engine
        .handle_sync(request("node-a", 0, changes))
        .await
        .unwrap();

    // node-b pages through in cap-sized chunks.
    let mut since = 0;
    let mut seen = Vec::new();
    loop {
        let resp = engine
            .handle_sync(request("node-b", since, vec![]))
            .await
            .unwrap();
        let full = resp.changes.len() == 2;
        seen.extend(resp.changes);
        since = resp.next_sequence;
        if !full {
            break;
        }
    }
    assert_eq!(seen.len(), 5);
    assert_eq!(since, 5);
}

#[tokio::test]
async fn byte_cap_still_ships_at_least_one_record() {
    let (_, engine) = engine();
    let engine = engine.with_response_caps(100, 10);

    let e = kitchen("2024-01-15T10:00:00Z");
    let e2 = kitchen("2024-01-15T10:00:01Z");
    engine
        .handle_sync(request(
            "node-a",
            0,
            vec![
                ChangeRecord::from_entity(ChangeKind::Create, &e, "node-a"),
                ChangeRecord::from_entity(ChangeKind::Create, &e2, "node-a"),
            ],
        ))
        .await
        .unwrap();

    let resp = engine
        .handle_sync(request("node-b", 0, vec![]))
        .await
        .unwrap();
    assert_eq!(resp.changes.len(), 1, "every record is larger than the cap");
    assert_eq!(resp.next_sequence, 1);
}

#[tokio::test]
async fn stale_cursor_and_bad_protocol_error_cleanly() {
    let (_, engine) = engine();

    let err = engine
        .handle_sync(request("node-a", 7, vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::StaleCursor { since: 7, head: 0 }));
    assert!(err.is_client_error());

    let mut req = request("node-a", 0, vec![]);
    req.protocol_version = "inbetweenies-v1".into();
    let err = engine.handle_sync(req).await.unwrap_err();
    assert!(matches!(err, SyncError::UnsupportedProtocol(_)));
    assert!(err.is_client_error());
    assert_eq!(PROTOCOL_VERSION, "inbetweenies-v2");
}

#[tokio::test]
async fn out_of_nowhere_update_with_unknown_parent_still_resolves() {
    // A replica may send an update whose parent chain the server has never
    // seen (it lost the base record). The resolver still decides.
    let (gateway, engine) = engine();
    let base = kitchen("2024-01-15T10:00:00Z");
    engine
        .handle_sync(request(
            "node-a",
            0,
            vec![ChangeRecord::from_entity(ChangeKind::Create, &base, "node-a")],
        ))
        .await
        .unwrap();

    let mut stray = floor_update(&base, "zoe", "2024-01-15T10:10:00.000Z", 8);
    stray.parent_versions = vec!["2024-01-15T09:59:59.000Z-ghost".into()];
    let resp = engine
        .handle_sync(request(
            "node-c",
            1,
            vec![ChangeRecord::from_entity(ChangeKind::Update, &stray, "node-c")],
        ))
        .await
        .unwrap();

    assert_eq!(resp.conflicts.len(), 1);
    assert_eq!(resp.conflicts[0].decision, ConflictDecision::AcceptedRemote);
    let current = gateway.get_current(&base.id).await.unwrap().unwrap();
    assert_eq!(current.version, stray.version);
}
