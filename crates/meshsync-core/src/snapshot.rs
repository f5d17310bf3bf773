//! Snapshots and their version maps.
//!
//! ## Overview
//!
//! A [`Snapshot`] is the immutable per-node view of every resource the node
//! should see, grouped by resource type. Each type carries an opaque version
//! string assigned by the [`crate::SnapshotVersioner`].
//!
//! Every declared supported type is always present (possibly empty), so
//! consumers computing deltas never have to distinguish "missing" from
//! "empty".
//!
//! The [`VersionMap`] (`type -> name -> content hash`) is built at most once
//! per snapshot instance and never changes afterwards. A new snapshot is
//! produced by replacement, never by editing an existing one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::canonical::content_hash;
use crate::error::{CoreError, Result};
use crate::hash::ContentHash;
use crate::resource::Resource;
use crate::types::ResourceType;

/// All resources of one type together with their version.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceSet {
    /// Opaque version. Empty until assigned by the versioner, unless the
    /// generator carried an explicit one.
    pub version: String,
    /// Resources keyed by [`Resource::snapshot_name`].
    pub items: BTreeMap<String, Resource>,
}

impl ResourceSet {
    /// Build an unversioned set from resources, keyed by snapshot name.
    pub fn from_resources(resources: impl IntoIterator<Item = Resource>) -> Self {
        Self {
            version: String::new(),
            items: resources
                .into_iter()
                .map(|r| (r.snapshot_name(), r))
                .collect(),
        }
    }

    /// Set an explicit version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether both sets carry the same resources.
    ///
    /// Same cardinality, and every key of `self` is present in `other`
    /// with a structurally equal value. Versions are ignored.
    pub fn same_items(&self, other: &ResourceSet) -> bool {
        self.items.len() == other.items.len()
            && self
                .items
                .iter()
                .all(|(name, res)| other.items.get(name) == Some(res))
    }
}

/// Content hashes of every resource in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionMap(BTreeMap<ResourceType, BTreeMap<String, ContentHash>>);

impl VersionMap {
    /// The hashes of one type, keyed by resource name.
    pub fn get_type(&self, resource_type: &ResourceType) -> Option<&BTreeMap<String, ContentHash>> {
        self.0.get(resource_type)
    }

    /// The hash of one resource.
    pub fn get(&self, resource_type: &ResourceType, name: &str) -> Option<&ContentHash> {
        self.0.get(resource_type).and_then(|m| m.get(name))
    }

    pub fn types(&self) -> impl Iterator<Item = &ResourceType> {
        self.0.keys()
    }
}

/// Immutable collection of versioned resource sets for one node.
#[derive(Debug, Clone)]
pub struct Snapshot {
    resources: BTreeMap<ResourceType, ResourceSet>,
    supported: BTreeSet<ResourceType>,
    version_map: OnceLock<VersionMap>,
}

impl Snapshot {
    /// An empty snapshot where every supported type is present and empty.
    pub fn empty(supported: impl IntoIterator<Item = ResourceType>) -> Self {
        let supported: BTreeSet<ResourceType> = supported.into_iter().collect();
        let resources = supported
            .iter()
            .map(|t| (t.clone(), ResourceSet::default()))
            .collect();
        Self {
            resources,
            supported,
            version_map: OnceLock::new(),
        }
    }

    /// Assemble a snapshot from explicit sets.
    ///
    /// Supported types without a set are filled with an empty one. Sets for
    /// undeclared types are kept so [`Snapshot::consistent`] can report them.
    pub fn from_parts(
        supported: impl IntoIterator<Item = ResourceType>,
        sets: impl IntoIterator<Item = (ResourceType, ResourceSet)>,
    ) -> Self {
        let mut snapshot = Self::empty(supported);
        snapshot.resources.extend(sets);
        snapshot
    }

    /// Declared supported types, in order.
    pub fn supported_types(&self) -> impl Iterator<Item = &ResourceType> {
        self.supported.iter()
    }

    pub fn is_supported(&self, resource_type: &ResourceType) -> bool {
        self.supported.contains(resource_type)
    }

    /// The resource set of a type.
    pub fn get_resources(&self, resource_type: &ResourceType) -> Option<&ResourceSet> {
        self.resources.get(resource_type)
    }

    /// The version of a type. Empty when unversioned.
    pub fn get_version(&self, resource_type: &ResourceType) -> Option<&str> {
        self.resources.get(resource_type).map(|s| s.version.as_str())
    }

    /// Every type and its version.
    pub fn versions(&self) -> BTreeMap<ResourceType, String> {
        self.resources
            .iter()
            .map(|(t, s)| (t.clone(), s.version.clone()))
            .collect()
    }

    /// A new snapshot with the given type versions replaced.
    ///
    /// Resource contents are unchanged, so an already built version map is
    /// carried over.
    pub fn with_versions(mut self, versions: BTreeMap<ResourceType, String>) -> Self {
        for (resource_type, version) in versions {
            if let Some(set) = self.resources.get_mut(&resource_type) {
                set.version = version;
            }
        }
        self
    }

    /// Check the structural invariants.
    ///
    /// Every supported type is present, no undeclared type is carried, and
    /// every item is stored under its own snapshot name and type.
    pub fn consistent(&self) -> Result<()> {
        for resource_type in &self.supported {
            if !self.resources.contains_key(resource_type) {
                return Err(CoreError::MissingType(resource_type.clone()));
            }
        }
        for (resource_type, set) in &self.resources {
            if !self.supported.contains(resource_type) {
                return Err(CoreError::UndeclaredType(resource_type.clone()));
            }
            for (stored_as, resource) in &set.items {
                if &resource.resource_type != resource_type || *stored_as != resource.snapshot_name() {
                    return Err(CoreError::MisplacedResource {
                        resource_type: resource.resource_type.clone(),
                        name: resource.snapshot_name(),
                        stored_as: stored_as.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// The content hash index, built on first use.
    pub fn version_map(&self) -> Result<&VersionMap> {
        if let Some(map) = self.version_map.get() {
            return Ok(map);
        }

        let mut map = BTreeMap::new();
        for (resource_type, set) in &self.resources {
            let mut hashes = BTreeMap::new();
            for (name, resource) in &set.items {
                hashes.insert(name.clone(), content_hash(resource)?);
            }
            map.insert(resource_type.clone(), hashes);
        }

        // A concurrent builder may have won; both maps are identical.
        Ok(self.version_map.get_or_init(|| VersionMap(map)))
    }

    /// Total number of resources across types.
    pub fn resource_count(&self) -> usize {
        self.resources.values().map(ResourceSet::len).sum()
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.supported == other.supported && self.resources == other.resources
    }
}
