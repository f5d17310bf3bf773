//! Node: the identity of a connected peer.
//!
//! A node is identified by the peer's client id and tenant, and carries the
//! feature flags negotiated on its connection.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::types::TenantId;

/// The peer reports health over the health-check RPC and may be declared
/// offline when it stops doing so.
pub const FEATURE_ZONE_PING_HEALTH: &str = "zone-ping-health";

/// Feature flags negotiated per connection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Features(BTreeSet<String>);

impl Features {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, feature: &str) -> bool {
        self.0.contains(feature)
    }

    pub fn insert(&mut self, feature: impl Into<String>) {
        self.0.insert(feature.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Features {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// A connected peer (zone control plane or proxy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// The client id the peer presented.
    pub id: String,
    pub tenant: TenantId,
    pub features: Features,
}

impl Node {
    pub fn new(id: impl Into<String>, tenant: TenantId) -> Self {
        Self {
            id: id.into(),
            tenant,
            features: Features::default(),
        }
    }

    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    /// The key under which this node's snapshot is cached.
    ///
    /// Derived from Blake3(id || tenant) so two tenants can use the same
    /// zone name without sharing a cache slot.
    pub fn cache_key(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"meshsync-node-v0:");
        hasher.update(self.id.as_bytes());
        hasher.update(b":");
        hasher.update(self.tenant.as_str().as_bytes());
        hex::encode(hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_is_deterministic() {
        let a = Node::new("zone-1", TenantId::new("acme"));
        let b = Node::new("zone-1", TenantId::new("acme"));
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_cache_key_separates_tenants() {
        let a = Node::new("zone-1", TenantId::new("acme"));
        let b = Node::new("zone-1", TenantId::new("other"));
        assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_cache_key_ignores_features() {
        let plain = Node::new("zone-1", TenantId::default_tenant());
        let featured = plain
            .clone()
            .with_features([FEATURE_ZONE_PING_HEALTH].into_iter().collect());
        assert_eq!(plain.cache_key(), featured.cache_key());
    }

    #[test]
    fn test_features_lookup() {
        let features: Features = ["a", "b"].into_iter().collect();
        assert!(features.has("a"));
        assert!(!features.has("c"));
    }
}
