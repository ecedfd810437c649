//! Replica-side sync bookkeeping.
//!
//! The coordinator owns everything the sync cycle needs between runs: the
//! outbound queue of pending local changes, the `since_sequence` cursor
//! into the server's change log, a connection-health indicator, and the
//! operator suspension flag.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use hearth_core::models::{ChangeRecord, LoggedChange, Relationship};
use hearth_graph::WriteSink;

/// How many consecutive failed cycles before the replica reports itself
/// offline rather than merely degraded.
const OFFLINE_AFTER: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionHealth {
    Healthy,
    Degraded { consecutive_failures: u32 },
    Offline { consecutive_failures: u32 },
}

#[derive(Default)]
pub struct ReplicaCoordinator {
    queue: Mutex<VecDeque<ChangeRecord>>,
    since_sequence: AtomicU64,
    consecutive_failures: AtomicU64,
    suspended: AtomicBool,
}

impl ReplicaCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a local change for the next cycle.
    pub async fn enqueue(&self, record: ChangeRecord) {
        let mut queue = self.queue.lock().await;
        queue.push_back(record);
        debug!(pending = queue.len(), "local change queued for sync");
    }

    /// Drains the front of the queue into a batch bounded by record count
    /// and serialized size. Records that don't fit stay queued.
    pub async fn collect_batch(&self, max_records: usize, max_bytes: usize) -> Vec<ChangeRecord> {
        let mut queue = self.queue.lock().await;
        let mut batch = Vec::new();
        let mut bytes = 0usize;
        while batch.len() < max_records {
            let Some(front) = queue.front() else { break };
            let size = serde_json::to_vec(front).map(|v| v.len()).unwrap_or(0);
            if !batch.is_empty() && bytes + size > max_bytes {
                break;
            }
            bytes += size;
            batch.push(queue.pop_front().expect("front just observed"));
        }
        batch
    }

    /// Puts a failed batch back at the front, in its original order.
    pub async fn requeue_front(&self, batch: Vec<ChangeRecord>) {
        let mut queue = self.queue.lock().await;
        for record in batch.into_iter().rev() {
            queue.push_front(record);
        }
        warn!(pending = queue.len(), "batch requeued after failed cycle");
    }

    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Last server sequence this replica has durably ingested.
    pub fn cursor(&self) -> u64 {
        self.since_sequence.load(Ordering::SeqCst)
    }

    /// Advances the cursor, never backwards.
    pub fn advance_cursor(&self, next_sequence: u64) {
        self.since_sequence
            .fetch_max(next_sequence, Ordering::SeqCst);
    }

    pub fn health(&self) -> ConnectionHealth {
        match self.consecutive_failures.load(Ordering::SeqCst) as u32 {
            0 => ConnectionHealth::Healthy,
            n if n < OFFLINE_AFTER => ConnectionHealth::Degraded { consecutive_failures: n },
            n => ConnectionHealth::Offline { consecutive_failures: n },
        }
    }

    pub fn mark_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub fn mark_failure(&self) -> ConnectionHealth {
        self.consecutive_failures
            .fetch_add(1, Ordering::SeqCst);
        let health = self.health();
        if let ConnectionHealth::Offline { consecutive_failures } = health {
            warn!(consecutive_failures, "replica considers itself offline");
        }
        health
    }

    /// Operator-requested pause, e.g. while a reset is in progress. Local
    /// writes keep queueing; only the outbound cycle is gated.
    pub fn suspend(&self) {
        info!("sync suspended");
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        info!("sync resumed");
        self.suspended.store(false, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }
}

/// The dispatcher sink that feeds local tool writes into the outbound
/// queue. Relationships stay local: the sync protocol carries entity
/// changes only.
pub struct CoordinatorSink {
    coordinator: Arc<ReplicaCoordinator>,
}

impl CoordinatorSink {
    pub fn new(coordinator: Arc<ReplicaCoordinator>) -> Self {
        CoordinatorSink { coordinator }
    }
}

#[async_trait]
impl WriteSink for CoordinatorSink {
    async fn change_committed(&self, change: &LoggedChange) {
        self.coordinator
            .enqueue(change.record.clone())
            .await;
    }

    async fn relationship_committed(&self, _rel: &Relationship) {}
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{DateTime, Utc};
    use hearth_core::models::{ChangeKind, Entity, EntityType, SourceType};
    use pretty_assertions::assert_eq;
    use serde_json::Map;

    fn record(name: &str) -> ChangeRecord {
        let entity = Entity::genesis(
            EntityType::Note,
            name,
            Map::new(),
            "alice",
            SourceType::Manual,
            DateTime::parse_from_rfc3339("2024-01-15T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        );
        ChangeRecord::from_entity(ChangeKind::Create, &entity, "node-a")
    }

    #[tokio::test]
    async fn batches_drain_in_order_and_requeue_at_the_front() {
        let coordinator = ReplicaCoordinator::new();
        for name in ["one", "two", "three"] {
            coordinator.enqueue(record(name)).await;
        }

        let batch = coordinator.collect_batch(2, usize::MAX).await;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].name.as_deref(), Some("one"));
        assert_eq!(coordinator.pending().await, 1);

        coordinator.requeue_front(batch).await;
        let batch = coordinator.collect_batch(10, usize::MAX).await;
        assert_eq!(
            batch
                .iter()
                .map(|r| r.name.as_deref().unwrap())
                .collect::<Vec<_>>(),
            vec!["one", "two", "three"]
        );
    }

    #[tokio::test]
    async fn byte_budget_defers_oversized_tail() {
        let coordinator = ReplicaCoordinator::new();
        coordinator.enqueue(record("one")).await;
        coordinator.enqueue(record("two")).await;

        // Budget fits one record only; the first always ships.
        let batch = coordinator.collect_batch(10, 10).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(coordinator.pending().await, 1);
    }

    #[tokio::test]
    async fn cursor_is_monotonic() {
        let coordinator = ReplicaCoordinator::new();
        coordinator.advance_cursor(5);
        coordinator.advance_cursor(3);
        assert_eq!(coordinator.cursor(), 5);
        coordinator.advance_cursor(9);
        assert_eq!(coordinator.cursor(), 9);
    }

    #[test]
    fn health_degrades_then_goes_offline() {
        let coordinator = ReplicaCoordinator::new();
        assert_eq!(coordinator.health(), ConnectionHealth::Healthy);
        assert_eq!(
            coordinator.mark_failure(),
            ConnectionHealth::Degraded { consecutive_failures: 1 }
        );
        coordinator.mark_failure();
        assert_eq!(
            coordinator.mark_failure(),
            ConnectionHealth::Offline { consecutive_failures: 3 }
        );
        coordinator.mark_success();
        assert_eq!(coordinator.health(), ConnectionHealth::Healthy);
    }

    #[test]
    fn suspension_flag_round_trips() {
        let coordinator = ReplicaCoordinator::new();
        assert!(!coordinator.is_suspended());
        coordinator.suspend();
        assert!(coordinator.is_suspended());
        coordinator.resume();
        assert!(!coordinator.is_suspended());
    }
}
