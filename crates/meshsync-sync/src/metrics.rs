//! Reconciliation counters.
//!
//! Plain in-process counters; exporting them is left to the embedder.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use meshsync_core::ResourceType;

/// Counters shared by reconcilers and watchdogs.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    /// New versions ready for delivery, per type.
    generations: Mutex<BTreeMap<ResourceType, u64>>,
    /// Versions discarded when a node went away, per type.
    discards: Mutex<BTreeMap<ResourceType, u64>>,
    reconciliations: AtomicU64,
    unchanged: AtomicU64,
    reconcile_errors: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_generation(&self, resource_type: &ResourceType) {
        bump(&self.generations, resource_type);
    }

    pub fn record_discard(&self, resource_type: &ResourceType) {
        bump(&self.discards, resource_type);
    }

    pub fn record_reconciliation(&self, changed: bool) {
        self.reconciliations.fetch_add(1, Ordering::Relaxed);
        if !changed {
            self.unchanged.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_reconcile_error(&self) {
        self.reconcile_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generations(&self, resource_type: &ResourceType) -> u64 {
        read(&self.generations, resource_type)
    }

    pub fn discards(&self, resource_type: &ResourceType) -> u64 {
        read(&self.discards, resource_type)
    }

    pub fn reconciliations(&self) -> u64 {
        self.reconciliations.load(Ordering::Relaxed)
    }

    /// Reconciliations that found nothing new.
    pub fn unchanged(&self) -> u64 {
        self.unchanged.load(Ordering::Relaxed)
    }

    pub fn reconcile_errors(&self) -> u64 {
        self.reconcile_errors.load(Ordering::Relaxed)
    }
}

fn bump(map: &Mutex<BTreeMap<ResourceType, u64>>, resource_type: &ResourceType) {
    *map.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(resource_type.clone())
        .or_insert(0) += 1;
}

fn read(map: &Mutex<BTreeMap<ResourceType, u64>>, resource_type: &ResourceType) -> u64 {
    map.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(resource_type)
        .copied()
        .unwrap_or(0)
}
