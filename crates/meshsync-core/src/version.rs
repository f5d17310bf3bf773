//! Per-type snapshot versioning.
//!
//! A version only changes when the resources of a type actually change, so
//! the delivery layer never pushes a response for a no-op reconciliation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use rand::RngCore;

use crate::snapshot::Snapshot;
use crate::types::ResourceType;

type VersionFn = Arc<dyn Fn() -> String + Send + Sync>;

/// Assigns versions to a freshly generated snapshot by diffing it with the
/// previous one.
///
/// For each type:
/// 1. an explicit version set by the generator is kept;
/// 2. otherwise, when the resources equal the old snapshot's, the old
///    version is reused;
/// 3. otherwise a new opaque version is minted.
#[derive(Clone)]
pub struct SnapshotVersioner {
    new_version: VersionFn,
}

impl SnapshotVersioner {
    /// A versioner minting random 16-byte hex identifiers.
    pub fn new() -> Self {
        Self {
            new_version: Arc::new(random_version),
        }
    }

    /// A versioner with a custom version source (deterministic tests).
    pub fn with_generator(f: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self {
            new_version: Arc::new(f),
        }
    }

    /// Version `new` against `old`.
    pub fn version(&self, new: Snapshot, old: Option<&Snapshot>) -> Snapshot {
        self.version_forced(new, old, &BTreeSet::new())
    }

    /// Version `new` against `old`, never reusing an old version for the
    /// types in `forced`.
    pub fn version_forced(
        &self,
        new: Snapshot,
        old: Option<&Snapshot>,
        forced: &BTreeSet<ResourceType>,
    ) -> Snapshot {
        let mut versions = BTreeMap::new();

        for resource_type in new.supported_types() {
            let Some(set) = new.get_resources(resource_type) else {
                continue;
            };
            if !set.version.is_empty() {
                continue;
            }

            let reused = if forced.contains(resource_type) {
                None
            } else {
                old.and_then(|old| old.get_resources(resource_type))
                    .filter(|old_set| !old_set.version.is_empty() && old_set.same_items(set))
                    .map(|old_set| old_set.version.clone())
            };

            let version = reused.unwrap_or_else(|| (self.new_version)());
            versions.insert(resource_type.clone(), version);
        }

        new.with_versions(versions)
    }
}

impl Default for SnapshotVersioner {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SnapshotVersioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotVersioner").finish_non_exhaustive()
    }
}

fn random_version() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
