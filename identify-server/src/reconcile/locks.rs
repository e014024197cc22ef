//! Advisory locks keyed by observed email / phone number
//!
//! Reconcile calls that share an email or phone number run one at a time.
//! Keys are always acquired in sorted order, so two calls locking
//! overlapping key sets cannot deadlock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Idle slots are dropped once the map grows past this many entries
const PRUNE_THRESHOLD: usize = 1024;

/// Registry of per-key async locks
#[derive(Debug, Default)]
pub struct ObservationLocks {
    slots: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Held locks for one reconcile call; released on drop
#[derive(Debug)]
pub struct ObservationGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl ObservationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for every lock in `keys`
    pub async fn acquire(&self, mut keys: Vec<String>) -> ObservationGuard {
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let slot = self.slot(key);
            guards.push(slot.lock_owned().await);
        }

        ObservationGuard { _guards: guards }
    }

    fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);

        // A slot only referenced by the map has no holder and no waiter
        if slots.len() >= PRUNE_THRESHOLD {
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        }

        slots.entry(key.to_string()).or_default().clone()
    }
}
