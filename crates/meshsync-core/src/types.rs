//! Strong type definitions for meshsync.
//!
//! Identifiers are newtypes so a tenant can never be passed where a
//! resource type is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The name of a resource type, e.g. `Mesh` or `ZoneInsight`.
///
/// Ordered so snapshots and dirty sets iterate deterministically.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceType(pub String);

impl ResourceType {
    /// Create a resource type from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The type name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceType({})", self.0)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceType {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// The key of a resource: its name and the mesh it belongs to.
///
/// Global-scoped resources (zones, insights) use an empty mesh.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ResourceKey {
    pub name: String,
    pub mesh: String,
}

impl ResourceKey {
    /// A key scoped to a mesh.
    pub fn new(name: impl Into<String>, mesh: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mesh: mesh.into(),
        }
    }

    /// A key for a resource that does not belong to any mesh.
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mesh: String::new(),
        }
    }

    /// The name used inside a snapshot: `<name>.<mesh>`.
    ///
    /// Keeps names unique across meshes. Global resources keep their plain name.
    pub fn snapshot_name(&self) -> String {
        if self.mesh.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, self.mesh)
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mesh.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.mesh, self.name)
        }
    }
}

/// Identifier of a tenant. The empty string is the default tenant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The default (single-tenant) tenant.
    pub fn default_tenant() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<default>")
        } else {
            f.write_str(&self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_name_includes_mesh() {
        let key = ResourceKey::new("backend", "default");
        assert_eq!(key.snapshot_name(), "backend.default");
    }

    #[test]
    fn test_snapshot_name_global() {
        let key = ResourceKey::global("zone-1");
        assert_eq!(key.snapshot_name(), "zone-1");
    }

    #[test]
    fn test_same_name_different_mesh_is_unique() {
        let a = ResourceKey::new("web", "mesh-a");
        let b = ResourceKey::new("web", "mesh-b");
        assert_ne!(a.snapshot_name(), b.snapshot_name());
    }

    #[test]
    fn test_tenant_display() {
        assert_eq!(TenantId::default_tenant().to_string(), "<default>");
        assert_eq!(TenantId::new("acme").to_string(), "acme");
    }
}
