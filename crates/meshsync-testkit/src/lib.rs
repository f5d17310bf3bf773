//! # meshsync Testkit
//!
//! Testing utilities for meshsync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a global control plane and zones wired over in-memory
//!   streams, plus resource builders
//! - **Stores**: a resource manager that fails on demand
//! - **Generators**: Proptest strategies for resources
//!
//! ## Test Fixtures
//!
//! ```rust,ignore
//! use meshsync_testkit::fixtures::{mesh, SyncFixture};
//!
//! let fixture = SyncFixture::new();
//! let zone = fixture.zone("zone-1");
//! let _conn = fixture.connect(&zone);
//!
//! fixture.global_store.create(&fixture.tenant, mesh("default")).await?;
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use meshsync_testkit::generators::resource;
//!
//! proptest! {
//!     #[test]
//!     fn hash_is_deterministic(r in resource()) {
//!         prop_assert_eq!(content_hash(&r).unwrap(), content_hash(&r).unwrap());
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;
pub mod stores;

pub use fixtures::{eventually, Connection, SyncFixture, ZoneFixture};
pub use stores::FailingStore;
