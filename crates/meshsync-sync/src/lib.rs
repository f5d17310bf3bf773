//! # meshsync Sync
//!
//! Reconciliation, watchdogs and delta delivery.
//!
//! ## Overview
//!
//! For every connected peer a watchdog decides when to reconcile. The
//! reconciler asks a snapshot generator for fresh resources, versions
//! them and publishes the result in the snapshot cache. The delta server
//! watches the cache and pushes what changed to the peer; the delta sync
//! client does the reverse, applying what the peer pushes.
//!
//! ```text
//!  store ──events──> watchdog ──> reconciler ──> cache ──> delta server ──> peer
//!                                    │
//!                              generator (filter, mapper)
//!
//!  peer ──> delta sync client ──> resource syncer ──> store
//! ```
//!
//! ## Key Types
//!
//! - [`SnapshotReconciler`] - Builds and caches versioned snapshots
//! - [`StoreSnapshotGenerator`] - Reads, filters and maps resources
//! - [`EventBasedWatchdog`] / [`IntervalWatchdog`] - Per-node loops
//! - [`DeltaServer`] - Pushes cached snapshots as deltas
//! - [`ResendForcer`] - Forces a resend after a NACK
//! - [`DeltaSyncClient`] - Applies a peer's deltas locally
//! - [`ZoneWatch`] - Declares silent zones offline
//! - [`HealthCheckService`] - Records zone health checks

pub mod cache;
pub mod client;
pub mod clock;
pub mod error;
pub mod filter;
pub mod generator;
pub mod health;
pub mod metrics;
pub mod reconciler;
pub mod resend;
pub mod server;
pub mod status;
pub mod watchdog;
pub mod zone_watch;

pub use cache::SnapshotCache;
pub use client::{DeltaSyncClient, ResourceSyncer, StoreResourceSyncer, UpstreamResponse};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, SyncError};
pub use filter::{
    CompositeFilter, CompositeMapper, HashSuffix, ResourceFilter, ResourceMapper, ResourcePredicate,
    DISPLAY_NAME_LABEL, ORIGIN_LABEL, ZONE_LABEL,
};
pub use generator::{SnapshotGenerator, StoreSnapshotGenerator};
pub use health::{
    run_health_check_loop, HealthCheckClient, HealthCheckConfig, HealthCheckService,
    LocalHealthCheckClient,
};
pub use metrics::SyncMetrics;
pub use reconciler::{Reconciler, SnapshotReconciler};
pub use resend::ResendForcer;
pub use server::{CallbackChain, DeltaCallbacks, DeltaServer, DeltaStreamState};
pub use status::{StatusTracker, TypeStats};
pub use watchdog::{EventBasedWatchdog, IntervalWatchdog, Watchdog, WatchdogConfig};
pub use zone_watch::{ZoneWatch, ZoneWatchConfig};
