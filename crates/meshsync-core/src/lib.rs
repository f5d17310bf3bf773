//! # meshsync Core
//!
//! Pure primitives for the meshsync control-plane synchronization engine:
//! resources, node identity, snapshots and content-addressed versions.
//!
//! This crate contains no I/O, no storage, no networking. It is pure
//! computation over resource collections.
//!
//! ## Key Types
//!
//! - [`Resource`] - A typed, keyed configuration object with a JSON spec
//! - [`Snapshot`] - Immutable per-node collection of resources grouped by type
//! - [`VersionMap`] - Lazily built `type -> name -> content hash` index
//! - [`SnapshotVersioner`] - Assigns per-type versions by diffing snapshots
//! - [`Node`] - The identity of a connected peer (id, tenant, features)
//!
//! ## Canonicalization
//!
//! Content hashes are computed over a deterministic CBOR encoding of each
//! resource. See [`canonical`] module.

pub mod canonical;
pub mod error;
pub mod hash;
pub mod node;
pub mod resource;
pub mod snapshot;
pub mod types;
pub mod version;

pub use canonical::{canonical_bytes, content_hash, decode_resource};
pub use error::{CoreError, Result};
pub use hash::{hashed_name, ContentHash};
pub use node::{Features, Node, FEATURE_ZONE_PING_HEALTH};
pub use resource::{Resource, ResourceMeta};
pub use snapshot::{ResourceSet, Snapshot, VersionMap};
pub use types::{ResourceKey, ResourceType, TenantId};
pub use version::SnapshotVersioner;
