use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;

use async_trait::async_trait;
use itertools::Itertools;
use tokio::sync::RwLock;
use tracing::debug;

use hearth_core::models::{
    ChangeRecord, Entity, EntityId, EntityType, LoggedChange, NodeId, Relationship,
};
use hearth_core::storage::{
    ChangeLogGateway, EntityGateway, NewVersion, RelationshipGateway, RepairReport, StorageError,
};
use hearth_core::version::parse_version;

#[derive(Default)]
struct StoreInner {
    /// Immutable version rows keyed by `(entity_id, version)`.
    versions: BTreeMap<(EntityId, String), Entity>,
    /// `id -> version` pointer; exactly one entry per known id.
    current: HashMap<EntityId, String>,
    relationships: BTreeMap<String, Relationship>,
    /// Append-only change log; `sequence == index + 1`.
    log: Vec<LoggedChange>,
}

impl StoreInner {
    fn id_has_rows(&self, id: &str) -> bool {
        self.versions
            .range(range_of(id))
            .next()
            .is_some()
    }

    fn current_entity(&self, id: &str) -> Option<&Entity> {
        let version = self.current.get(id)?;
        self.versions.get(&(id.to_owned(), version.clone()))
    }

    fn append_log(&mut self, record: ChangeRecord) -> LoggedChange {
        let logged = LoggedChange { sequence: self.log.len() as u64 + 1, record };
        self.log.push(logged.clone());
        logged
    }

    /// Shared validation + insertion for both commit flavors.
    fn insert_version(&mut self, new: &NewVersion) -> Result<(), StorageError> {
        let entity = &new.entity;
        let key = (entity.id.clone(), entity.version.clone());
        if self.versions.contains_key(&key) {
            return Err(StorageError::DuplicateVersion {
                entity_id: entity.id.clone(),
                version: entity.version.clone(),
            });
        }
        self.versions.insert(key, entity.clone());
        Ok(())
    }
}

fn range_of(id: &str) -> (Bound<(EntityId, String)>, Bound<(EntityId, String)>) {
    (
        Bound::Included((id.to_owned(), String::new())),
        Bound::Excluded((format!("{id}\u{0}"), String::new())),
    )
}

/// The workspace's reference gateway: ordered maps behind one RwLock.
///
/// Cloning is cheap and shares the underlying store, so the same instance
/// can back the graph index, the sync engine and the tool dispatcher at
/// once.
#[derive(Default)]
pub struct InMemoryGateway {
    inner: RwLock<StoreInner>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityGateway for InMemoryGateway {
    async fn commit(&self, new: NewVersion) -> Result<LoggedChange, StorageError> {
        let mut inner = self.inner.write().await;
        inner.insert_version(&new)?;
        inner
            .current
            .insert(new.entity.id.clone(), new.entity.version.clone());
        let record = ChangeRecord::from_entity(new.kind, &new.entity, new.origin_node_id.clone());
        let logged = inner.append_log(record);
        debug!(
            entity_id = %new.entity.id,
            version = %new.entity.version,
            sequence = logged.sequence,
            kind = %new.kind,
            "committed version"
        );
        Ok(logged)
    }

    async fn commit_superseded(&self, new: NewVersion) -> Result<LoggedChange, StorageError> {
        let mut inner = self.inner.write().await;
        inner.insert_version(&new)?;
        let record = ChangeRecord::from_entity(new.kind, &new.entity, new.origin_node_id.clone());
        let logged = inner.append_log(record);
        debug!(
            entity_id = %new.entity.id,
            version = %new.entity.version,
            sequence = logged.sequence,
            "stored superseded version"
        );
        Ok(logged)
    }

    async fn get_current(&self, id: &str) -> Result<Option<Entity>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.current_entity(id).cloned())
    }

    async fn get_version(&self, id: &str, version: &str) -> Result<Entity, StorageError> {
        let inner = self.inner.read().await;
        inner
            .versions
            .get(&(id.to_owned(), version.to_owned()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound("entity version", format!("{id}@{version}")))
    }

    async fn list_versions(&self, id: &str) -> Result<Vec<Entity>, StorageError> {
        let inner = self.inner.read().await;
        let rows: Vec<Entity> = inner
            .versions
            .range(range_of(id))
            .map(|(_, e)| e.clone())
            .collect();
        if rows.is_empty() {
            return Err(StorageError::NotFound("entity", id.to_owned()));
        }
        Ok(rows)
    }

    async fn contains_version(&self, id: &str, version: &str) -> Result<bool, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .versions
            .contains_key(&(id.to_owned(), version.to_owned())))
    }

    async fn all_current(&self) -> Result<Vec<Entity>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .current
            .keys()
            .sorted()
            .filter_map(|id| inner.current_entity(id))
            .filter(|e| !e.tombstone)
            .cloned()
            .collect())
    }

    async fn find_by_type(&self, entity_type: EntityType) -> Result<Vec<Entity>, StorageError> {
        Ok(self
            .all_current()
            .await?
            .into_iter()
            .filter(|e| e.entity_type == entity_type)
            .collect())
    }

    async fn find_by_name_substring(&self, q: &str) -> Result<Vec<Entity>, StorageError> {
        let needle = q.to_lowercase();
        Ok(self
            .all_current()
            .await?
            .into_iter()
            .filter(|e| e.name.to_lowercase().contains(&needle))
            .collect())
    }

    async fn repair_scan(&self) -> Result<RepairReport, StorageError> {
        let inner = self.inner.read().await;
        let mut report = RepairReport::default();
        let mut seen_versions: HashMap<&str, &str> = HashMap::new();

        for ((id, version), entity) in &inner.versions {
            report.rows_scanned += 1;
            if entity.id != *id || entity.version != *version {
                report
                    .findings
                    .push(format!("row keyed {id}@{version} disagrees with its own identity"));
                continue;
            }
            if parse_version(version).is_err() {
                report
                    .findings
                    .push(format!("version string of {id}@{version} does not parse"));
            }
            if let Some(prev) = seen_versions.insert(version, id) {
                if prev != id {
                    report
                        .findings
                        .push(format!("version `{version}` is shared by `{prev}` and `{id}`"));
                }
            }
            for parent in &entity.parent_versions {
                if !inner
                    .versions
                    .contains_key(&(id.clone(), parent.clone()))
                {
                    report
                        .findings
                        .push(format!("{id}@{version} references missing parent `{parent}`"));
                }
            }
        }

        for (id, version) in &inner.current {
            if !inner
                .versions
                .contains_key(&(id.clone(), version.clone()))
            {
                report
                    .findings
                    .push(format!("current pointer of `{id}` targets missing row `{version}`"));
            }
        }
        let ids_with_rows: HashSet<&EntityId> = inner.versions.keys().map(|(id, _)| id).collect();
        for id in ids_with_rows {
            if !inner.current.contains_key(id) {
                report
                    .findings
                    .push(format!("entity `{id}` has rows but no current pointer"));
            }
        }

        for rel in inner.relationships.values() {
            for endpoint in [&rel.from_id, &rel.to_id] {
                if !inner.id_has_rows(endpoint) {
                    report.findings.push(format!(
                        "relationship `{}` references missing entity `{endpoint}`",
                        rel.id
                    ));
                }
            }
        }

        for (idx, logged) in inner.log.iter().enumerate() {
            if logged.sequence != idx as u64 + 1 {
                report.findings.push(format!(
                    "change log sequence {} found at position {idx}",
                    logged.sequence
                ));
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl RelationshipGateway for InMemoryGateway {
    async fn put_relationship(&self, rel: Relationship) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        for endpoint in [&rel.from_id, &rel.to_id] {
            if !inner.id_has_rows(endpoint) {
                return Err(StorageError::NotFound("entity", endpoint.clone()));
            }
        }
        inner.relationships.insert(rel.id.clone(), rel);
        Ok(())
    }

    async fn get_relationship(&self, id: &str) -> Result<Relationship, StorageError> {
        let inner = self.inner.read().await;
        inner
            .relationships
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound("relationship", id.to_owned()))
    }

    async fn relationships_of(&self, entity_id: &str) -> Result<Vec<Relationship>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .relationships
            .values()
            .filter(|r| r.touches(entity_id))
            .cloned()
            .collect())
    }

    async fn all_relationships(&self) -> Result<Vec<Relationship>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.relationships.values().cloned().collect())
    }

    async fn delete_relationship(&self, id: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner
            .relationships
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound("relationship", id.to_owned()))
    }
}

#[async_trait]
impl ChangeLogGateway for InMemoryGateway {
    async fn scan_changes(
        &self,
        since_sequence: u64,
        limit: usize,
    ) -> Result<Vec<LoggedChange>, StorageError> {
        let inner = self.inner.read().await;
        let start = (since_sequence as usize).min(inner.log.len());
        Ok(inner.log[start..]
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn scan_changes_excluding(
        &self,
        since_sequence: u64,
        limit: usize,
        exclude_origin: &str,
    ) -> Result<Vec<LoggedChange>, StorageError> {
        let inner = self.inner.read().await;
        let start = (since_sequence as usize).min(inner.log.len());
        Ok(inner.log[start..]
            .iter()
            .filter(|c| c.record.origin_node_id != exclude_origin)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn head_sequence(&self) -> Result<u64, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.log.len() as u64)
    }

    async fn origin_vector(&self) -> Result<HashMap<NodeId, u64>, StorageError> {
        let inner = self.inner.read().await;
        let mut vector = HashMap::new();
        for logged in &inner.log {
            let mark = vector
                .entry(logged.record.origin_node_id.clone())
                .or_insert(0);
            *mark = (*mark).max(logged.sequence);
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{DateTime, Utc};
    use hearth_core::models::{ChangeKind, SourceType};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn room(name: &str, at: &str) -> Entity {
        let mut content = Map::new();
        content.insert("floor".into(), json!(1));
        Entity::genesis(EntityType::Room, name, content, "alice", SourceType::Manual, ts(at))
    }

    #[tokio::test]
    async fn commit_moves_current_and_logs() {
        let store = InMemoryGateway::new();
        let e = room("Kitchen", "2024-01-15T10:00:00Z");
        let logged = store
            .commit(NewVersion::create(e.clone(), "node-a"))
            .await
            .unwrap();
        assert_eq!(logged.sequence, 1);
        assert_eq!(logged.record.kind, ChangeKind::Create);
        assert_eq!(store.get_current(&e.id).await.unwrap(), Some(e.clone()));
        assert_eq!(store.head_sequence().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_version_is_rejected_without_side_effects() {
        let store = InMemoryGateway::new();
        let e = room("Kitchen", "2024-01-15T10:00:00Z");
        store
            .commit(NewVersion::create(e.clone(), "node-a"))
            .await
            .unwrap();
        let err = store
            .commit(NewVersion::create(e.clone(), "node-a"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StorageError::DuplicateVersion { entity_id: e.id.clone(), version: e.version.clone() }
        );
        // The failed write neither logged nor moved anything.
        assert_eq!(store.head_sequence().await.unwrap(), 1);
        assert_eq!(store.list_versions(&e.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_chain_keeps_history_and_single_current() {
        let store = InMemoryGateway::new();
        let e = room("Kitchen", "2024-01-15T10:00:00Z");
        store
            .commit(NewVersion::create(e.clone(), "node-a"))
            .await
            .unwrap();
        let mut content = Map::new();
        content.insert("floor".into(), json!(2));
        let e2 = e.next_version(None, content, "alice", ts("2024-01-15T10:05:00Z"));
        store
            .commit(NewVersion::update(e2.clone(), "node-a"))
            .await
            .unwrap();

        assert_eq!(store.get_current(&e.id).await.unwrap(), Some(e2.clone()));
        assert_eq!(store.list_versions(&e.id).await.unwrap(), vec![e.clone(), e2.clone()]);
        assert_eq!(
            store.get_version(&e.id, &e.version).await.unwrap(),
            e,
            "history row stays reachable after the pointer moved"
        );
    }

    #[tokio::test]
    async fn superseded_commit_leaves_current_untouched() {
        let store = InMemoryGateway::new();
        let e = room("Kitchen", "2024-01-15T10:00:00Z");
        store
            .commit(NewVersion::create(e.clone(), "node-a"))
            .await
            .unwrap();
        let mut content = Map::new();
        content.insert("floor".into(), json!(9));
        let loser = e.next_version(None, content, "bob", ts("2024-01-15T10:05:00Z"));
        store
            .commit_superseded(NewVersion::update(loser.clone(), "node-b"))
            .await
            .unwrap();

        assert_eq!(store.get_current(&e.id).await.unwrap(), Some(e.clone()));
        assert_eq!(store.list_versions(&e.id).await.unwrap().len(), 2);
        assert_eq!(store.head_sequence().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn tombstones_disappear_from_current_listings() {
        let store = InMemoryGateway::new();
        let e = room("Kitchen", "2024-01-15T10:00:00Z");
        store
            .commit(NewVersion::create(e.clone(), "node-a"))
            .await
            .unwrap();
        let dead = e.tombstone_version("alice", ts("2024-01-15T10:07:00Z"));
        store
            .commit(NewVersion::delete(dead.clone(), "node-a"))
            .await
            .unwrap();

        assert_eq!(store.all_current().await.unwrap(), vec![]);
        assert_eq!(store.find_by_type(EntityType::Room).await.unwrap(), vec![]);
        // But the tombstone is still the current version, observable by id.
        assert_eq!(store.get_current(&e.id).await.unwrap(), Some(dead));
    }

    #[tokio::test]
    async fn name_search_is_case_insensitive() {
        let store = InMemoryGateway::new();
        store
            .commit(NewVersion::create(room("Kitchen", "2024-01-15T10:00:00Z"), "node-a"))
            .await
            .unwrap();
        store
            .commit(NewVersion::create(room("Living Room", "2024-01-15T10:00:01Z"), "node-a"))
            .await
            .unwrap();

        let hits = store.find_by_name_substring("KITCH").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "Kitchen");
    }

    #[tokio::test]
    async fn relationships_require_existing_endpoints() {
        let store = InMemoryGateway::new();
        let a = room("Kitchen", "2024-01-15T10:00:00Z");
        store
            .commit(NewVersion::create(a.clone(), "node-a"))
            .await
            .unwrap();
        let rel = Relationship::new(
            a.id.clone(),
            "nope",
            hearth_core::models::RelationshipType::ConnectsTo,
            Map::new(),
            "alice",
            ts("2024-01-15T10:00:02Z"),
        );
        assert_eq!(
            store.put_relationship(rel).await.unwrap_err(),
            StorageError::NotFound("entity", "nope".into())
        );
    }

    #[tokio::test]
    async fn relationships_read_and_delete_by_id() {
        let store = InMemoryGateway::new();
        let a = room("Kitchen", "2024-01-15T10:00:00Z");
        let b = room("Hall", "2024-01-15T10:00:01Z");
        store
            .commit(NewVersion::create(a.clone(), "node-a"))
            .await
            .unwrap();
        store
            .commit(NewVersion::create(b.clone(), "node-a"))
            .await
            .unwrap();
        let rel = Relationship::new(
            a.id.clone(),
            b.id.clone(),
            hearth_core::models::RelationshipType::ConnectsTo,
            Map::new(),
            "alice",
            ts("2024-01-15T10:00:02Z"),
        );
        store.put_relationship(rel.clone()).await.unwrap();

        assert_eq!(store.get_relationship(&rel.id).await.unwrap(), rel);
        assert_eq!(store.relationships_of(&a.id).await.unwrap(), vec![rel.clone()]);
        assert_eq!(store.relationships_of(&b.id).await.unwrap(), vec![rel.clone()]);

        store.delete_relationship(&rel.id).await.unwrap();
        assert_eq!(
            store.delete_relationship(&rel.id).await.unwrap_err(),
            StorageError::NotFound("relationship", rel.id.clone())
        );
        assert!(store.relationships_of(&a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn change_log_scans_are_ordered_and_filterable() {
        let store = InMemoryGateway::new();
        let a = room("Kitchen", "2024-01-15T10:00:00Z");
        let b = room("Hall", "2024-01-15T10:00:01Z");
        store
            .commit(NewVersion::create(a.clone(), "node-a"))
            .await
            .unwrap();
        store
            .commit(NewVersion::create(b.clone(), "node-b"))
            .await
            .unwrap();

        let all = store.scan_changes(0, 100).await.unwrap();
        assert_eq!(all.iter().map(|c| c.sequence).collect::<Vec<_>>(), vec![1, 2]);

        let foreign = store
            .scan_changes_excluding(0, 100, "node-a")
            .await
            .unwrap();
        assert_eq!(foreign.len(), 1);
        assert_eq!(foreign[0].record.entity_id, b.id);

        assert_eq!(store.scan_changes(2, 100).await.unwrap(), vec![]);
        assert_eq!(
            store.origin_vector().await.unwrap(),
            HashMap::from([("node-a".to_string(), 1), ("node-b".to_string(), 2)])
        );
    }

    #[tokio::test]
    async fn repair_scan_is_clean_on_a_healthy_store() {
        let store = InMemoryGateway::new();
        let e = room("Kitchen", "2024-01-15T10:00:00Z");
        store
            .commit(NewVersion::create(e.clone(), "node-a"))
            .await
            .unwrap();
        let mut content = Map::new();
        content.insert("floor".into(), json!(2));
        let e2 = e.next_version(None, content, "alice", ts("2024-01-15T10:05:00Z"));
        store
            .commit(NewVersion::update(e2, "node-a"))
            .await
            .unwrap();

        let report = store.repair_scan().await.unwrap();
        assert!(report.is_clean(), "unexpected findings: {:?}", report.findings);
        assert_eq!(report.rows_scanned, 2);
    }

    #[test_log::test(tokio::test)]
    async fn repair_scan_reports_missing_parents() {
        let store = InMemoryGateway::new();
        let e = room("Kitchen", "2024-01-15T10:00:00Z");
        let mut orphan = e.next_version(None, Map::new(), "alice", ts("2024-01-15T10:05:00Z"));
        orphan.parent_versions = vec!["2023-01-01T00:00:00.000Z-ghost".into()];
        store
            .commit(NewVersion::update(orphan, "node-a"))
            .await
            .unwrap();

        let report = store.repair_scan().await.unwrap();
        assert_eq!(report.findings.len(), 1);
        assert!(report.findings[0].contains("missing parent"));
    }
}
