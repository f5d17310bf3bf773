//! # meshsync Store
//!
//! Storage abstraction for meshsync.
//!
//! The sync engine does not own resource storage. It reads through
//! [`ReadOnlyResourceManager`], and the zone-to-global sink and health
//! checks write through [`ResourceManager`]. Mutations made through a
//! manager publish `ResourceChanged` events on the event bus, which is
//! what wakes the watchdogs.
//!
//! ## Implementations
//!
//! - [`MemoryStore`] - In-memory, for tests and embedding
//!
//! ## Zone insights
//!
//! The [`insight`] module reads and writes the health-check and stream
//! bookkeeping stored on `ZoneInsight` resources.

pub mod error;
pub mod insight;
pub mod memory;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use traits::{upsert, ReadOnlyResourceManager, ResourceManager};
