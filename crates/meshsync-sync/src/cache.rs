//! Per-node snapshot cache.
//!
//! The reconciler writes one snapshot per node key and the delta server
//! reads it. Each key has a `watch` channel, so a server waiting on a node
//! wakes as soon as a newer snapshot is written. Different keys never
//! contend on more than the short map lock.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::watch;

use meshsync_core::Snapshot;

type Slot = watch::Sender<Option<Arc<Snapshot>>>;

/// Snapshot cache keyed by node key (see [`meshsync_core::Node::cache_key`]).
#[derive(Default)]
pub struct SnapshotCache {
    slots: RwLock<HashMap<String, Slot>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot of a node and wake its watchers.
    pub fn set_snapshot(&self, key: &str, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(Arc::clone(&snapshot)));
        snapshot
    }

    /// The current snapshot of a node.
    pub fn get_snapshot(&self, key: &str) -> Option<Arc<Snapshot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(|slot| slot.borrow().clone())
    }

    pub fn has_snapshot(&self, key: &str) -> bool {
        self.get_snapshot(key).is_some()
    }

    /// Remove the snapshot of a node, returning it.
    ///
    /// Watchers are told the snapshot is gone. Empty slots are dropped
    /// once nobody watches them.
    pub fn clear_snapshot(&self, key: &str) -> Option<Arc<Snapshot>> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let previous = slots.get(key)?.send_replace(None);
        prune(&mut slots);
        previous
    }

    /// Watch the snapshot of a node. The receiver sees the current value
    /// immediately and every later replacement.
    pub fn watch(&self, key: &str) -> watch::Receiver<Option<Arc<Snapshot>>> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        prune(&mut slots);
        slots
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Keys that currently hold a snapshot.
    pub fn node_keys(&self) -> Vec<String> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, slot)| slot.borrow().is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// Drop slots that hold no snapshot and have no watchers left.
fn prune(slots: &mut HashMap<String, Slot>) {
    slots.retain(|_, slot| slot.receiver_count() > 0 || slot.borrow().is_some());
}
