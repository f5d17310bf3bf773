//! Snapshot generation: read a node's resources from the store.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use meshsync_core::{Node, Resource, ResourceSet, ResourceType, Snapshot};
use meshsync_store::ReadOnlyResourceManager;

use crate::error::{Result, SyncError};
use crate::filter::{AcceptAll, Identity, ResourceFilter, ResourceMapper};

/// Produces snapshots for nodes.
#[async_trait]
pub trait SnapshotGenerator: Send + Sync {
    /// Every type this generator can produce.
    fn supported_types(&self) -> &BTreeSet<ResourceType>;

    /// Build a snapshot for `node` holding the requested types.
    ///
    /// Requested types outside [`supported_types`](Self::supported_types)
    /// are ignored; the result declares every supported type.
    async fn generate_snapshot(&self, node: &Node, types: &BTreeSet<ResourceType>) -> Result<Snapshot>;
}

/// Generator backed by a resource manager.
///
/// Lists each requested type in the node's tenant, drops what the filter
/// rejects and runs the rest through the mapper.
pub struct StoreSnapshotGenerator {
    manager: Arc<dyn ReadOnlyResourceManager>,
    supported: BTreeSet<ResourceType>,
    filter: Arc<dyn ResourceFilter>,
    mapper: Arc<dyn ResourceMapper>,
}

impl StoreSnapshotGenerator {
    pub fn new(
        manager: Arc<dyn ReadOnlyResourceManager>,
        supported: impl IntoIterator<Item = ResourceType>,
    ) -> Self {
        Self {
            manager,
            supported: supported.into_iter().collect(),
            filter: Arc::new(AcceptAll),
            mapper: Arc::new(Identity),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn ResourceFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn ResourceMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    async fn generate_set(&self, node: &Node, resource_type: &ResourceType) -> Result<ResourceSet> {
        let listed = self.manager.list(&node.tenant, resource_type).await?;

        let mut kept = Vec::with_capacity(listed.len());
        for resource in listed {
            if !self.filter.filter(&node.id, &node.features, &resource).await {
                continue;
            }
            let name = resource.snapshot_name();
            let mapped = self
                .mapper
                .map(&node.features, resource)
                .map_err(|source| SyncError::Mapper {
                    resource_type: resource_type.clone(),
                    name,
                    source,
                })?;
            kept.push(mapped);
        }

        Ok(ResourceSet::from_resources(kept))
    }
}

#[async_trait]
impl SnapshotGenerator for StoreSnapshotGenerator {
    fn supported_types(&self) -> &BTreeSet<ResourceType> {
        &self.supported
    }

    async fn generate_snapshot(&self, node: &Node, types: &BTreeSet<ResourceType>) -> Result<Snapshot> {
        let mut sets = Vec::new();
        for resource_type in types.intersection(&self.supported) {
            sets.push((resource_type.clone(), self.generate_set(node, resource_type).await?));
        }
        Ok(Snapshot::from_parts(self.supported.iter().cloned(), sets))
    }
}

/// Keep only resources of one mesh. Handy for per-mesh proxies.
pub fn mesh_scoped(mesh: impl Into<String>) -> impl ResourceFilter {
    let mesh = mesh.into();
    move |_: &str, _: &meshsync_core::Features, r: &Resource| r.key.mesh.is_empty() || r.key.mesh == mesh
}
