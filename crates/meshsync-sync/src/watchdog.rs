//! Watchdogs: per-node loops deciding when to reconcile.
//!
//! ## Overview
//!
//! One watchdog runs per connected node for as long as its stream lives.
//! Every trigger is handled from a single `select!`, so state transitions
//! never interleave. When the cancellation token fires, the node's
//! snapshot is cleared before the loop returns.
//!
//! - [`EventBasedWatchdog`] batches resource-changed events into a dirty
//!   set and flushes it on a short tick, with a periodic full resync.
//! - [`IntervalWatchdog`] rebuilds every provided type on every tick.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use meshsync_core::{Node, ResourceType};
use meshsync_events::{Event, EventBus, Listener};

use crate::error::{Result, SyncError};
use crate::metrics::SyncMetrics;
use crate::reconciler::Reconciler;

/// Watchdog timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// How often accumulated changes are reconciled.
    pub flush_interval: Duration,
    /// How often every type is marked dirty regardless of events.
    pub full_resync_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            full_resync_interval: Duration::from_secs(60),
        }
    }
}

impl WatchdogConfig {
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval.is_zero() {
            return Err(SyncError::Config("flush_interval must be positive".into()));
        }
        if self.full_resync_interval.is_zero() {
            return Err(SyncError::Config("full_resync_interval must be positive".into()));
        }
        Ok(())
    }
}

/// A per-node reconciliation loop.
#[async_trait]
pub trait Watchdog: Send {
    /// Run until `cancel` fires. The node's snapshot is cleared on exit.
    async fn run(&mut self, cancel: CancellationToken);
}

// ─────────────────────────────────────────────────────────────────────────────
// Event based
// ─────────────────────────────────────────────────────────────────────────────

/// Reconciles the types touched by store events.
pub struct EventBasedWatchdog {
    node: Node,
    reconciler: Arc<dyn Reconciler>,
    provided: BTreeSet<ResourceType>,
    listener: Listener,
    config: WatchdogConfig,
    metrics: Arc<SyncMetrics>,
    dirty: BTreeSet<ResourceType>,
}

impl EventBasedWatchdog {
    /// Subscribe to resource changes on `bus` and start with every
    /// provided type dirty.
    pub fn new(
        node: Node,
        reconciler: Arc<dyn Reconciler>,
        provided: BTreeSet<ResourceType>,
        bus: &EventBus,
        config: WatchdogConfig,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let listener = bus.subscribe_where(|e| matches!(e, Event::ResourceChanged(_)));
        Self {
            node,
            reconciler,
            dirty: provided.clone(),
            provided,
            listener,
            config,
            metrics,
        }
    }

    /// Types waiting for the next flush.
    pub fn dirty(&self) -> &BTreeSet<ResourceType> {
        &self.dirty
    }

    fn on_event(&mut self, event: Event) {
        let Event::ResourceChanged(changed) = event else {
            return;
        };
        if changed.tenant_id != self.node.tenant || !self.provided.contains(&changed.resource_type) {
            return;
        }
        self.dirty.insert(changed.resource_type);
    }

    async fn flush(&mut self) {
        let mut types = self.dirty.clone();
        types.extend(self.reconciler.forced_types(&self.node));
        if types.is_empty() {
            return;
        }

        match self.reconciler.reconcile(&self.node, &types).await {
            Ok(changed) => {
                if changed {
                    tracing::debug!(node = %self.node.id, ?types, "snapshot updated");
                }
                self.dirty.clear();
            }
            Err(e) => {
                self.metrics.record_reconcile_error();
                tracing::error!(node = %self.node.id, "reconcile failed: {}", e);
            }
        }
    }

    async fn stop(&mut self) {
        self.reconciler.clear(&self.node).await;
        self.listener.close();
    }
}

#[async_trait]
impl Watchdog for EventBasedWatchdog {
    async fn run(&mut self, cancel: CancellationToken) {
        let mut flush = interval(self.config.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resync = interval_at(
            Instant::now() + self.config.full_resync_interval,
            self.config.full_resync_interval,
        );
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.stop().await;
                    return;
                }
                _ = flush.tick() => self.flush().await,
                _ = resync.tick() => {
                    self.dirty.extend(self.provided.iter().cloned());
                }
                event = self.listener.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => {
                        tracing::debug!(node = %self.node.id, "event bus closed, relying on full resync");
                        self.listener = Listener::never();
                    }
                },
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Interval only
// ─────────────────────────────────────────────────────────────────────────────

/// Rebuilds every provided type on a fixed tick.
pub struct IntervalWatchdog {
    node: Node,
    reconciler: Arc<dyn Reconciler>,
    provided: BTreeSet<ResourceType>,
    interval: Duration,
    metrics: Arc<SyncMetrics>,
}

impl IntervalWatchdog {
    pub fn new(
        node: Node,
        reconciler: Arc<dyn Reconciler>,
        provided: BTreeSet<ResourceType>,
        interval: Duration,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            node,
            reconciler,
            provided,
            interval,
            metrics,
        }
    }
}

#[async_trait]
impl Watchdog for IntervalWatchdog {
    async fn run(&mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.reconciler.clear(&self.node).await;
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconciler.reconcile(&self.node, &self.provided).await {
                        self.metrics.record_reconcile_error();
                        tracing::error!(node = %self.node.id, "reconcile failed: {}", e);
                    }
                }
            }
        }
    }
}
