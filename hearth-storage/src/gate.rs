//! Per-entity write serialization.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes writers per entity id: at most one version of a given id is
/// in flight at once, while writes to different ids proceed in parallel.
///
/// The gate hands out owned guards so callers can hold them across awaits
/// (the store commit happens inside the hold). Lock entries are kept for
/// the lifetime of the gate; the id space is the entity population, which
/// is bounded and small compared to the versions written through it.
#[derive(Default)]
pub struct WriteGate {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WriteGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive write access to `id`.
    pub async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
