//! Last-write-wins conflict resolution.
//!
//! The resolver decides between two competing versions of the same entity
//! id whenever an incoming version's parent chain does not include the
//! receiver's current version. It is a pure function of its two inputs and
//! the configured tiebreak window: every node, given the same pair, must
//! reach the same decision, or replicas stop converging.
//!
//! Decision order:
//! 1. Timestamps further apart than the tiebreak window: the later
//!    `updated_at` wins.
//! 2. Within the window, a tombstone beats a non-tombstone.
//! 3. Otherwise the lexicographically greater `(user_id, version)` wins.
//!
//! Merges are never produced by [`Resolver::resolve`]; callers that want
//! three-way semantics ask for them explicitly via
//! [`Resolver::resolve_three_way`].

use chrono::{DateTime, Duration, Utc};
use serde_json::Map;

use crate::models::Entity;
use crate::version::format_version;

/// Outcome of resolving a local/remote pair.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// The remote version becomes current; the local one is superseded.
    AcceptRemote,
    /// The local version stays current; the remote one is superseded.
    KeepLocal,
    /// A fresh version parented on both competitors becomes current.
    Merge(Entity),
}

#[derive(Clone, Debug)]
pub struct Resolver {
    tiebreak_window: Duration,
}

impl Default for Resolver {
    fn default() -> Self {
        Resolver { tiebreak_window: Duration::milliseconds(1000) }
    }
}

impl Resolver {
    pub fn new(tiebreak_window: Duration) -> Self {
        Resolver { tiebreak_window }
    }

    pub fn with_window_millis(millis: i64) -> Self {
        Self::new(Duration::milliseconds(millis))
    }

    /// Decides between the receiver's current version and an incoming one.
    ///
    /// Symmetric by construction: swapping the arguments flips the decision.
    pub fn resolve(&self, local: &Entity, remote: &Entity) -> Resolution {
        debug_assert_eq!(local.id, remote.id, "resolver compares versions of one id");

        let delta = remote.updated_at - local.updated_at;
        if delta.abs() > self.tiebreak_window {
            return if delta > Duration::zero() {
                Resolution::AcceptRemote
            } else {
                Resolution::KeepLocal
            };
        }

        // Within the window a deletion outranks any concurrent edit.
        match (local.tombstone, remote.tombstone) {
            (false, true) => return Resolution::AcceptRemote,
            (true, false) => return Resolution::KeepLocal,
            _ => {}
        }

        let local_key = (&local.user_id, &local.version);
        let remote_key = (&remote.user_id, &remote.version);
        if remote_key > local_key {
            Resolution::AcceptRemote
        } else {
            Resolution::KeepLocal
        }
    }

    /// Three-way resolution: builds a merge version parented on both
    /// competitors instead of discarding the loser.
    ///
    /// The winner (per [`Resolver::resolve`]) contributes its name and
    /// tombstone state and overrides the loser's content key-wise; keys only
    /// the loser has survive. Parents are ordered loser-then-winner so the
    /// winning lineage is always the last element.
    pub fn resolve_three_way(
        &self,
        local: &Entity,
        remote: &Entity,
        merge_user: &str,
        at: DateTime<Utc>,
    ) -> Resolution {
        let remote_wins = matches!(self.resolve(local, remote), Resolution::AcceptRemote);
        let (winner, loser) = if remote_wins { (remote, local) } else { (local, remote) };

        // Tombstones don't merge; deletion wins outright.
        if winner.tombstone {
            return if remote_wins { Resolution::AcceptRemote } else { Resolution::KeepLocal };
        }

        let mut content: Map<_, _> = loser.content.clone();
        for (k, v) in &winner.content {
            content.insert(k.clone(), v.clone());
        }

        let merged = Entity {
            id: winner.id.clone(),
            version: format_version(at, merge_user),
            entity_type: winner.entity_type,
            name: winner.name.clone(),
            content,
            parent_versions: vec![loser.version.clone(), winner.version.clone()],
            tombstone: false,
            user_id: merge_user.to_owned(),
            source_type: winner.source_type,
            created_at: winner.created_at.min(loser.created_at),
            updated_at: at,
        };
        Resolution::Merge(merged)
    }
}
