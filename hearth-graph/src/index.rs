//! The in-memory graph overlay.
//!
//! Keeps exactly the state read-side tools need: current versions of live
//! entities, relationship adjacency, and an inverted token index. The
//! write path calls [`GraphIndex::apply_entity`] /
//! [`GraphIndex::apply_relationship`] under its own serialization, so the
//! index never runs ahead of the store; readers get a consistent snapshot
//! per call.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use hearth_core::models::{Entity, EntityId, EntityType, Relationship};
use hearth_core::storage::{Gateway, StorageError};

use crate::tokens::{entity_tokens, jaccard, tokenize};

#[derive(Default)]
struct IndexInner {
    entities: HashMap<EntityId, Entity>,
    tokens_by_entity: HashMap<EntityId, BTreeSet<String>>,
    inverted: HashMap<String, BTreeSet<EntityId>>,
    relationships: BTreeMap<String, Relationship>,
    /// Entity id -> ids of relationships touching it.
    adjacency: HashMap<EntityId, BTreeSet<String>>,
}

impl IndexInner {
    fn index_tokens(&mut self, entity: &Entity) {
        let tokens = entity_tokens(entity);
        for token in &tokens {
            self.inverted
                .entry(token.clone())
                .or_default()
                .insert(entity.id.clone());
        }
        self.tokens_by_entity
            .insert(entity.id.clone(), tokens);
    }

    fn drop_tokens(&mut self, id: &str) {
        if let Some(tokens) = self.tokens_by_entity.remove(id) {
            for token in tokens {
                if let Some(ids) = self.inverted.get_mut(&token) {
                    ids.remove(id);
                    if ids.is_empty() {
                        self.inverted.remove(&token);
                    }
                }
            }
        }
    }

    fn insert_relationship(&mut self, rel: Relationship) {
        self.adjacency
            .entry(rel.from_id.clone())
            .or_default()
            .insert(rel.id.clone());
        self.adjacency
            .entry(rel.to_id.clone())
            .or_default()
            .insert(rel.id.clone());
        self.relationships.insert(rel.id.clone(), rel);
    }

    fn remove_relationship(&mut self, rel_id: &str) {
        if let Some(rel) = self.relationships.remove(rel_id) {
            for endpoint in [&rel.from_id, &rel.to_id] {
                if let Some(ids) = self.adjacency.get_mut(endpoint) {
                    ids.remove(rel_id);
                    if ids.is_empty() {
                        self.adjacency.remove(endpoint);
                    }
                }
            }
        }
    }

    /// Live relationships of an entity: both endpoints must still be
    /// current and non-tombstoned.
    fn live_relationships(&self, id: &str) -> Vec<&Relationship> {
        self.adjacency
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|rel_id| self.relationships.get(rel_id))
            .filter(|rel| {
                self.entities.contains_key(&rel.from_id) && self.entities.contains_key(&rel.to_id)
            })
            .collect()
    }

    /// Ids adjacent to `id` over live relationships, deduplicated and
    /// ordered.
    fn neighbor_ids(&self, id: &str) -> BTreeSet<&EntityId> {
        self.live_relationships(id)
            .into_iter()
            .filter_map(|rel| rel.other_endpoint(id))
            .collect()
    }

    /// Unweighted distances from `start` over live adjacency.
    fn bfs_distances(&self, start: &str) -> HashMap<EntityId, usize> {
        let mut dist = HashMap::new();
        dist.insert(start.to_owned(), 0usize);
        let mut queue = VecDeque::from([start.to_owned()]);
        while let Some(node) = queue.pop_front() {
            let d = dist[&node];
            for next in self.neighbor_ids(&node) {
                if !dist.contains_key(next.as_str()) {
                    dist.insert(next.clone(), d + 1);
                    queue.push_back(next.clone());
                }
            }
        }
        dist
    }
}

/// Shared, lock-guarded graph overlay. Clone freely; clones share state.
#[derive(Clone, Default)]
pub struct GraphIndex {
    inner: Arc<RwLock<IndexInner>>,
}

impl GraphIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cold-start rebuild from the gateway's current versions.
    pub async fn rebuild(&self, gateway: &dyn Gateway) -> Result<(), StorageError> {
        let entities = gateway.all_current().await?;
        let relationships = gateway.all_relationships().await?;
        let mut inner = self.inner.write().await;
        *inner = IndexInner::default();
        let entity_count = entities.len();
        for entity in entities {
            inner.index_tokens(&entity);
            inner.entities.insert(entity.id.clone(), entity);
        }
        let rel_count = relationships.len();
        for rel in relationships {
            inner.insert_relationship(rel);
        }
        info!(entities = entity_count, relationships = rel_count, "graph index rebuilt");
        Ok(())
    }

    /// Folds one committed entity version into the overlay.
    pub async fn apply_entity(&self, entity: &Entity) {
        let mut inner = self.inner.write().await;
        inner.drop_tokens(&entity.id);
        if entity.tombstone {
            inner.entities.remove(&entity.id);
            debug!(entity_id = %entity.id, "entity tombstoned out of index");
        } else {
            inner.index_tokens(entity);
            inner
                .entities
                .insert(entity.id.clone(), entity.clone());
        }
    }

    pub async fn apply_relationship(&self, rel: &Relationship) {
        let mut inner = self.inner.write().await;
        inner.insert_relationship(rel.clone());
    }

    pub async fn remove_relationship(&self, rel_id: &str) {
        let mut inner = self.inner.write().await;
        inner.remove_relationship(rel_id);
    }

    pub async fn get(&self, id: &str) -> Option<Entity> {
        let inner = self.inner.read().await;
        inner.entities.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entities.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Live relationships touching `id`, ordered by relationship id.
    pub async fn relationships_of(&self, id: &str) -> Vec<Relationship> {
        let inner = self.inner.read().await;
        inner
            .live_relationships(id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Live neighbor entities of `id` with the connecting relationship.
    pub async fn neighbors(&self, id: &str) -> Vec<(Relationship, Entity)> {
        let inner = self.inner.read().await;
        inner
            .live_relationships(id)
            .into_iter()
            .filter_map(|rel| {
                let other = rel.other_endpoint(id)?;
                Some((rel.clone(), inner.entities.get(other)?.clone()))
            })
            .collect()
    }

    /// Ranked token search. Score is the number of distinct query tokens an
    /// entity matches; ties order by entity id so results are stable.
    pub async fn search(
        &self,
        query: &str,
        types: Option<&[EntityType]>,
        limit: usize,
    ) -> Vec<(Entity, usize)> {
        let query_tokens: BTreeSet<String> = tokenize(query).collect();
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let inner = self.inner.read().await;
        let mut scores: BTreeMap<&EntityId, usize> = BTreeMap::new();
        for token in &query_tokens {
            if let Some(ids) = inner.inverted.get(token) {
                for id in ids {
                    *scores.entry(id).or_default() += 1;
                }
            }
        }
        let mut hits: Vec<(&EntityId, usize)> = scores
            .into_iter()
            .filter(|(id, _)| {
                types.map_or(true, |ts| {
                    inner
                        .entities
                        .get(*id)
                        .map_or(false, |e| ts.contains(&e.entity_type))
                })
            })
            .collect();
        hits.sort_by(|(a_id, a_score), (b_id, b_score)| {
            b_score.cmp(a_score).then_with(|| a_id.cmp(b_id))
        });
        hits.into_iter()
            .take(limit)
            .filter_map(|(id, score)| Some((inner.entities.get(id)?.clone(), score)))
            .collect()
    }

    /// Shortest path between two live entities over live relationships.
    ///
    /// Returns the ordered id sequence including both endpoints, `None`
    /// when unreachable. Among equal-length paths the lexicographically
    /// least id sequence is chosen: the walk greedily picks, at each hop,
    /// the smallest neighbor that still lies on some shortest path
    /// (checked against distance maps computed from both ends).
    pub async fn find_path(&self, from: &str, to: &str) -> Option<Vec<EntityId>> {
        let inner = self.inner.read().await;
        if !inner.entities.contains_key(from) || !inner.entities.contains_key(to) {
            return None;
        }
        if from == to {
            return Some(vec![from.to_owned()]);
        }
        let dist_from = inner.bfs_distances(from);
        let total = *dist_from.get(to)?;
        let dist_to = inner.bfs_distances(to);

        let mut path = vec![from.to_owned()];
        let mut node = from.to_owned();
        for step in 1..=total {
            let next = inner
                .neighbor_ids(&node)
                .into_iter()
                .find(|n| {
                    dist_from.get(n.as_str()) == Some(&step)
                        && dist_to.get(n.as_str()) == Some(&(total - step))
                })?
                .clone();
            path.push(next.clone());
            node = next;
        }
        Some(path)
    }

    /// Jaccard similarity of two entities' token sets.
    pub async fn similarity(&self, a: &str, b: &str) -> Option<f64> {
        let inner = self.inner.read().await;
        Some(jaccard(
            inner.tokens_by_entity.get(a)?,
            inner.tokens_by_entity.get(b)?,
        ))
    }

    /// Entities ranked by similarity to `id`, descending, ties by id.
    /// Scores below `threshold` are dropped.
    pub async fn find_similar(&self, id: &str, threshold: f64) -> Option<Vec<(Entity, f64)>> {
        let inner = self.inner.read().await;
        let reference = inner.tokens_by_entity.get(id)?;
        let mut scored: Vec<(Entity, f64)> = inner
            .entities
            .values()
            .filter(|e| e.id != id)
            .filter_map(|e| {
                let score = jaccard(reference, inner.tokens_by_entity.get(&e.id)?);
                (score >= threshold).then(|| (e.clone(), score))
            })
            .collect();
        scored.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        Some(scored)
    }
}
