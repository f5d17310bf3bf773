//! Resource: the unit of configuration synchronized between control planes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{ResourceKey, ResourceType};

/// Store-assigned metadata of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceMeta {
    /// Store revision of the resource. Empty until persisted.
    pub version: String,
    /// Free-form labels (origin, zone, ...).
    pub labels: BTreeMap<String, String>,
}

/// A typed, keyed configuration object.
///
/// The spec is opaque to the sync engine; it is only hashed and shipped.
/// Equality is structural over every field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub resource_type: ResourceType,
    pub key: ResourceKey,
    pub meta: ResourceMeta,
    pub spec: serde_json::Value,
}

impl Resource {
    /// Create an unversioned resource.
    pub fn new(resource_type: ResourceType, key: ResourceKey, spec: serde_json::Value) -> Self {
        Self {
            resource_type,
            key,
            meta: ResourceMeta::default(),
            spec,
        }
    }

    /// Attach a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.labels.insert(key.into(), value.into());
        self
    }

    /// The name this resource is indexed under inside a snapshot.
    pub fn snapshot_name(&self) -> String {
        self.key.snapshot_name()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.meta.labels.get(key).map(String::as_str)
    }
}
