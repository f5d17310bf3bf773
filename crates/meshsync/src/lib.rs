//! # meshsync
//!
//! Resource synchronization between a global control plane and its zones.
//!
//! ## Overview
//!
//! This crate ties the component crates into the two sides of a sync
//! connection:
//!
//! - [`GlobalSyncServer`] accepts streams from zones, pushes global
//!   resources down and stores what zones report up. It also hosts the
//!   zone watch and the health check service.
//! - [`ZoneSyncClient`] opens streams to global and does the reverse.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use meshsync::{GlobalSyncServer, SyncConfig};
//! use meshsync::core::ResourceType;
//! use meshsync::events::EventBus;
//! use meshsync::store::MemoryStore;
//!
//! let bus = EventBus::default();
//! let store = Arc::new(MemoryStore::with_event_bus(bus.clone()));
//! let global = GlobalSyncServer::new(
//!     store,
//!     bus,
//!     [ResourceType::new("Mesh")],
//!     [ResourceType::new("Dataplane")],
//!     SyncConfig::default(),
//! )?;
//!
//! tokio::spawn(global.zone_watch().run(cancel.clone()));
//! global.serve(stream).await?;
//! ```

pub mod config;
mod endpoint;
pub mod error;
pub mod global;
pub mod zone;

pub use config::SyncConfig;
pub use error::{MeshSyncError, Result};
pub use global::GlobalSyncServer;
pub use zone::ZoneSyncClient;

// Re-export component crates
pub use meshsync_core as core;
pub use meshsync_events as events;
pub use meshsync_mux as mux;
pub use meshsync_store as store;
pub use meshsync_sync as sync;

/// Node id under which global appears to zones.
pub const GLOBAL_NODE_ID: &str = "global";
