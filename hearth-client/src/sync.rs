//! Client half of the Inbetweenies cycle.
//!
//! One cycle walks the state machine
//! IDLE → COLLECTING → SENDING → APPLYING → UPDATING_VECTOR → IDLE,
//! with FAILED as the terminal state of a cycle that could not complete.
//! Cancellation is honored only while COLLECTING or SENDING; once the send
//! has succeeded the cycle runs to completion so the cursor never claims
//! records that were not actually ingested.
//!
//! Transient transport failures retry with exponential backoff (base 1 s,
//! factor 2, ±20% jitter, capped at 60 s). 4xx answers are the request's
//! own fault and abort the cycle immediately.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use rand::Rng;
use tokio::sync::watch;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, instrument, warn};

use hearth_core::dto::{
    SyncRequest, SyncResponse, MAX_BATCH_BYTES, MAX_BATCH_RECORDS,
};
use hearth_core::models::{ChangeRecord, NodeId, UserId};
use hearth_core::resolver::{Resolution, Resolver};
use hearth_core::storage::{Gateway, NewVersion, StorageError};
use hearth_graph::GraphIndex;
use hearth_storage::WriteGate;

use crate::coordinator::ReplicaCoordinator;
use crate::transport::{SyncTransport, TransportError};

/// Base 1 s doubling per attempt, capped at the protocol's 60 s.
static DEFAULT_BACKOFF: Lazy<ExponentialBackoff> = Lazy::new(|| {
    ExponentialBackoff::from_millis(2)
        .factor(500)
        .max_delay(Duration::from_secs(60))
});

const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// ±20% jitter so replicas that failed together don't retry together.
fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.8..=1.2))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Collecting,
    Sending,
    Applying,
    UpdatingVector,
    Failed,
}

/// What one completed cycle did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleReport {
    pub sent: usize,
    pub applied: usize,
    pub conflicts: usize,
    pub duplicates: u64,
    pub next_sequence: u64,
    /// The server may hold more records than one response batch; loop.
    pub server_has_more: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum ClientSyncError {
    #[error("sync is suspended by the operator")]
    Suspended,
    #[error("cycle cancelled before the send completed")]
    Cancelled,
    #[error("request rejected by the server: {0}")]
    Rejected(String),
    #[error("transport failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: TransportError },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Requests cancellation: the in-flight cycle aborts if it is still in a
/// cancellable state, otherwise the next cycle does.
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

pub struct SyncClient {
    transport: Arc<dyn SyncTransport>,
    coordinator: Arc<ReplicaCoordinator>,
    gateway: Arc<dyn Gateway>,
    index: GraphIndex,
    resolver: Resolver,
    gate: Arc<WriteGate>,
    node_id: NodeId,
    user_id: UserId,
    max_attempts: u32,
    state: watch::Sender<SyncState>,
    cancel: watch::Receiver<bool>,
    cancel_tx: watch::Sender<bool>,
}

impl SyncClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn SyncTransport>,
        coordinator: Arc<ReplicaCoordinator>,
        gateway: Arc<dyn Gateway>,
        index: GraphIndex,
        resolver: Resolver,
        gate: Arc<WriteGate>,
        node_id: impl Into<NodeId>,
        user_id: impl Into<UserId>,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        let (cancel_tx, cancel) = watch::channel(false);
        SyncClient {
            transport,
            coordinator,
            gateway,
            index,
            resolver,
            gate,
            node_id: node_id.into(),
            user_id: user_id.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            state,
            cancel,
            cancel_tx,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Observe state transitions, e.g. for a UI.
    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel_tx.clone())
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn enter(&self, state: SyncState) {
        debug!(?state, "sync state");
        let _ = self.state.send(state);
    }

    /// Runs one full cycle: collect, send (with retries), apply, advance.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn run_cycle(&self) -> Result<CycleReport, ClientSyncError> {
        if self.coordinator.is_suspended() {
            return Err(ClientSyncError::Suspended);
        }

        self.enter(SyncState::Collecting);
        if self.is_cancelled() {
            self.enter(SyncState::Idle);
            return Err(ClientSyncError::Cancelled);
        }
        let batch = self
            .coordinator
            .collect_batch(MAX_BATCH_RECORDS, MAX_BATCH_BYTES)
            .await;

        self.enter(SyncState::Sending);
        let mut request = SyncRequest::new(
            self.node_id.clone(),
            self.user_id.clone(),
            self.coordinator.cursor(),
        );
        request.changes = batch.clone();

        let response = match self.send_with_retry(&request).await {
            Ok(response) => response,
            Err(err) => {
                // The records are not lost; they lead the next batch.
                self.coordinator.requeue_front(batch).await;
                if !matches!(err, ClientSyncError::Cancelled) {
                    self.coordinator.mark_failure();
                    self.enter(SyncState::Failed);
                } else {
                    self.enter(SyncState::Idle);
                }
                return Err(err);
            }
        };

        // The send succeeded: from here the cycle must complete, or the
        // cursor would lie about what was ingested.
        self.enter(SyncState::Applying);
        let mut applied = 0usize;
        let mut duplicates = 0u64;
        for change in &response.changes {
            match self.apply_remote(change).await {
                Ok(true) => applied += 1,
                Ok(false) => duplicates += 1,
                Err(err) => {
                    // The cursor stays put, so the unapplied tail of this
                    // batch comes back next cycle (already-applied records
                    // then land in the duplicate path).
                    self.coordinator.mark_failure();
                    self.enter(SyncState::Failed);
                    return Err(err);
                }
            }
        }

        self.enter(SyncState::UpdatingVector);
        self.coordinator
            .advance_cursor(response.next_sequence);
        self.coordinator.mark_success();
        self.enter(SyncState::Idle);

        let report = CycleReport {
            sent: request.changes.len(),
            applied,
            conflicts: response.conflicts.len(),
            duplicates: duplicates + response.duplicates,
            next_sequence: response.next_sequence,
            server_has_more: response.changes.len() >= MAX_BATCH_RECORDS,
        };
        info!(
            sent = report.sent,
            applied = report.applied,
            conflicts = report.conflicts,
            next_sequence = report.next_sequence,
            "sync cycle complete"
        );
        Ok(report)
    }

    /// Cycles until both directions are quiet: nothing left to push and
    /// the server has no more pages to pull.
    pub async fn sync_to_convergence(&self) -> Result<CycleReport, ClientSyncError> {
        loop {
            let report = self.run_cycle().await?;
            if !report.server_has_more && self.coordinator.pending().await == 0 {
                return Ok(report);
            }
        }
    }

    async fn send_with_retry(
        &self,
        request: &SyncRequest,
    ) -> Result<SyncResponse, ClientSyncError> {
        let mut backoff = DEFAULT_BACKOFF.clone();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.is_cancelled() {
                return Err(ClientSyncError::Cancelled);
            }
            match self.transport.exchange(request).await {
                Ok(response) => return Ok(response),
                Err(err) if !err.is_retriable() => {
                    return Err(ClientSyncError::Rejected(err.to_string()));
                }
                Err(err) if attempt >= self.max_attempts => {
                    return Err(ClientSyncError::Exhausted { attempts: attempt, last: err });
                }
                Err(err) => {
                    let delay = jittered(backoff.next().unwrap_or(Duration::from_secs(60)));
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "sync send failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Applies one server record. Returns false for a duplicate.
    ///
    /// Divergence runs through the same resolver as the server's, so both
    /// sides reach the same decision independently; the server's conflict
    /// list is authoritative if they ever disagree.
    async fn apply_remote(&self, change: &ChangeRecord) -> Result<bool, ClientSyncError> {
        let _guard = self.gate.acquire(&change.entity_id).await;

        if self
            .gateway
            .contains_version(&change.entity_id, &change.version)
            .await?
        {
            return Ok(false);
        }

        let current = self.gateway.get_current(&change.entity_id).await?;
        let incoming = change.to_entity(current.as_ref().map(|c| c.created_at));

        let accepted = match &current {
            None => true,
            Some(cur) if incoming.parent_versions.contains(&cur.version) => true,
            Some(cur) => {
                let accepted =
                    self.resolver.resolve(cur, &incoming) == Resolution::AcceptRemote;
                debug!(
                    entity_id = %change.entity_id,
                    local_version = %cur.version,
                    incoming_version = %incoming.version,
                    accepted,
                    "local divergence resolved"
                );
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
            self.gateway.commit_superseded(new).await?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_doubles_from_one_second_and_caps() {
        let delays: Vec<Duration> = DEFAULT_BACKOFF.clone().take(8).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[2], Duration::from_secs(4));
        assert_eq!(delays[7], Duration::from_secs(60), "capped at the protocol maximum");
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        for _ in 0..100 {
            let d = jittered(Duration::from_secs(10));
            assert!(d >= Duration::from_secs(8), "got {d:?}");
            assert!(d <= Duration::from_secs(12), "got {d:?}");
        }
    }
}
