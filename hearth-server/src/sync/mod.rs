//! Server half of the Inbetweenies cycle.
//!
//! One [`SyncEngine::handle_sync`] call is one request/response exchange:
//! validate the envelope, apply the client's outbound changes in order
//! (consulting the resolver on divergence), then assemble the response
//! batch from the change log.
//!
//! ## Ordering
//!
//! Inbound records are applied in the order the client sent them, each
//! under the per-entity-id gate, so at most one version of a given id is in
//! flight at once while different ids commit in parallel with read traffic
//! and other sync sessions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use hearth_core::dto::{
    ConflictDecision, ConflictNotice, SyncRequest, SyncResponse, MAX_BATCH_BYTES,
    MAX_BATCH_RECORDS, PROTOCOL_VERSION,
};
use hearth_core::models::{ChangeRecord, NodeId};
use hearth_core::resolver::{Resolution, Resolver};
use hearth_core::storage::{Gateway, NewVersion, StorageError};
use hearth_graph::GraphIndex;
use hearth_storage::WriteGate;

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("unsupported protocol version `{0}`")]
    UnsupportedProtocol(String),
    #[error("cursor {since} is ahead of the server head {head}")]
    StaleCursor { since: u64, head: u64 },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// Whether the client should treat this as its own fault (4xx) rather
    /// than retry.
    pub fn is_client_error(&self) -> bool {
        matches!(self, SyncError::UnsupportedProtocol(_) | SyncError::StaleCursor { .. })
    }
}

pub struct SyncEngine {
    gateway: Arc<dyn Gateway>,
    index: GraphIndex,
    resolver: Resolver,
    gate: Arc<WriteGate>,
    node_id: NodeId,
    max_response_records: usize,
    max_response_bytes: usize,
}

impl SyncEngine {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        index: GraphIndex,
        resolver: Resolver,
        gate: Arc<WriteGate>,
        node_id: impl Into<NodeId>,
    ) -> Self {
        SyncEngine {
            gateway,
            index,
            resolver,
            gate,
            node_id: node_id.into(),
            max_response_records: MAX_BATCH_RECORDS,
            max_response_bytes: MAX_BATCH_BYTES,
        }
    }

    /// Overrides the response batch caps. Mainly for tests; the defaults
    /// are the protocol's.
    pub fn with_response_caps(mut self, max_records: usize, max_bytes: usize) -> Self {
        self.max_response_records = max_records;
        self.max_response_bytes = max_bytes;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// One full request/response exchange.
    #[instrument(skip(self, request), fields(node_id = %request.node_id, since = request.since_sequence, inbound = request.changes.len()))]
    pub async fn handle_sync(&self, request: SyncRequest) -> Result<SyncResponse, SyncError> {
        if request.protocol_version != PROTOCOL_VERSION {
            return Err(SyncError::UnsupportedProtocol(request.protocol_version));
        }
        let head = self.gateway.head_sequence().await?;
        if request.since_sequence > head {
            return Err(SyncError::StaleCursor { since: request.since_sequence, head });
        }

        let mut conflicts = Vec::new();
        let mut duplicates = 0u64;
        for change in &request.changes {
            self.apply_change(change, &mut conflicts, &mut duplicates)
                .await?;
        }

        let (changes, next_sequence) = self
            .collect_response_batch(request.since_sequence, &request.node_id)
            .await?;

        info!(
            applied = request.changes.len(),
            conflicts = conflicts.len(),
            duplicates,
            outbound = changes.len(),
            next_sequence,
            "sync exchange complete"
        );

        Ok(SyncResponse {
            server_time: Utc::now(),
            changes,
            conflicts,
            duplicates,
            next_sequence,
            vector: self.vector().await?,
        })
    }

    /// Applies one inbound record under its entity's write gate.
    async fn apply_change(
        &self,
        change: &ChangeRecord,
        conflicts: &mut Vec<ConflictNotice>,
        duplicates: &mut u64,
    ) -> Result<(), SyncError> {
        let _guard = self.gate.acquire(&change.entity_id).await;

        if self
            .gateway
            .contains_version(&change.entity_id, &change.version)
            .await?
        {
            *duplicates += 1;
            debug!(entity_id = %change.entity_id, version = %change.version, "duplicate ignored");
            return Ok(());
        }

        let current = self.gateway.get_current(&change.entity_id).await?;
        let incoming = change.to_entity(current.as_ref().map(|c| c.created_at));

        let accepted = match &current {
            // No current version, or the sender built on top of ours:
            // fast-path accept.
            None => true,
            Some(cur) if incoming.parent_versions.contains(&cur.version) => true,
            Some(cur) => {
                let resolution = self.resolver.resolve(cur, &incoming);
                let accepted = resolution == Resolution::AcceptRemote;
                warn!(
                    entity_id = %change.entity_id,
                    server_version = %cur.version,
                    incoming_version = %incoming.version,
                    accepted,
                    "divergent write resolved"
                );
                conflicts.push(ConflictNotice {
                    entity_id: change.entity_id.clone(),
                    local_version: incoming.version.clone(),
                    server_version: cur.version.clone(),
                    decision: if accepted {
                        ConflictDecision::AcceptedRemote
                    } else {
                        ConflictDecision::KeptLocal
                    },
                });
                accepted
            }
        };

        let new = NewVersion {
            entity: incoming.clone(),
            kind: change.kind,
            origin_node_id: change.origin_node_id.clone(),
        };
        if accepted {
            self.gateway.commit(new).await?;
            self.index.apply_entity(&incoming).await;
        } else {
            // The losing side still enters history and the log; only the
            // current pointer records the winner.
            self.gateway.commit_superseded(new).await?;
        }
        Ok(())
    }

    /// Change-log records the caller lacks, in order, capped by count and
    /// serialized size. Returns the records and the cursor the client
    /// should advance to.
    async fn collect_response_batch(
        &self,
        since_sequence: u64,
        exclude_origin: &str,
    ) -> Result<(Vec<ChangeRecord>, u64), SyncError> {
        let logged = self
            .gateway
            .scan_changes_excluding(since_sequence, self.max_response_records, exclude_origin)
            .await?;

        let mut changes = Vec::new();
        let mut last_sequence = None;
        let mut bytes = 0usize;
        for entry in logged {
            let size = serde_json::to_vec(&entry.record)
                .map(|v| v.len())
                .unwrap_or(0);
            // Always ship at least one record so a single oversized change
            // cannot wedge the cycle.
            if !changes.is_empty() && bytes + size > self.max_response_bytes {
                break;
            }
            bytes += size;
            last_sequence = Some(entry.sequence);
            changes.push(entry.record);
        }

        // An empty payload still advances the cursor to the head, past any
        // records that were filtered out as the caller's own echoes.
        let next_sequence = match last_sequence {
            Some(seq) => seq,
            None => self.gateway.head_sequence().await?,
        };
        Ok((changes, next_sequence))
    }

    pub async fn vector(&self) -> Result<HashMap<NodeId, u64>, SyncError> {
        Ok(self.gateway.origin_vector().await?)
    }
}

#[cfg(test)]
mod test;
