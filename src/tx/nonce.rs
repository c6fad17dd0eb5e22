//! Nonce slot write serialization
//!
//! All writes that touch records of one sender on one network go through a
//! per-(account, network) lock, so the finalized-heads callback, the
//! new-heads callback and the timeout of a watch (and of sibling watches on
//! the same sender) never interleave their read-modify-write cycles.

use crate::state::SlotKey;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Registry of per-slot locks
#[derive(Default)]
pub struct SlotLocks {
    locks: DashMap<SlotKey, Arc<Mutex<()>>>,
}

impl SlotLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Wait for exclusive access to a sender's records on one network
    pub async fn acquire(&self, key: &SlotKey) -> OwnedMutexGuard<()> {
        // clone the lock out so the map shard is not held across the await
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop locks nobody is holding or waiting on
    pub fn release_idle(&self) {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let released = before.saturating_sub(self.locks.len());
        if released > 0 {
            debug!("Released {} idle slot locks", released);
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
