//! In-memory implementation of the resource manager traits.
//!
//! Used by tests and by embedders that keep resources elsewhere and only
//! need a cache. Mutations bump a store-wide revision counter, which is
//! written into `meta.version`, and publish `ResourceChanged` events.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use meshsync_core::{Resource, ResourceKey, ResourceType, TenantId};
use meshsync_events::{EventBus, Operation, ResourceChangedEvent};

use crate::error::{Result, StoreError};
use crate::traits::{ReadOnlyResourceManager, ResourceManager};

type StoreKey = (TenantId, ResourceType, ResourceKey);

/// In-memory store.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
    bus: Option<EventBus>,
}

#[derive(Default)]
struct MemoryStoreInner {
    resources: BTreeMap<StoreKey, Resource>,
    revision: u64,
}

impl MemoryStoreInner {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

impl MemoryStore {
    /// Create a new empty store that publishes no events.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
            bus: None,
        }
    }

    /// Create a store publishing `ResourceChanged` events on `bus`.
    pub fn with_event_bus(bus: EventBus) -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
            bus: Some(bus),
        }
    }

    /// Number of stored resources across tenants and types.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resources
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, operation: Operation, tenant: &TenantId, resource_type: &ResourceType, key: &ResourceKey) {
        if let Some(bus) = &self.bus {
            bus.send(ResourceChangedEvent {
                operation,
                resource_type: resource_type.clone(),
                key: key.clone(),
                tenant_id: tenant.clone(),
            });
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadOnlyResourceManager for MemoryStore {
    async fn list(&self, tenant: &TenantId, resource_type: &ResourceType) -> Result<Vec<Resource>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .resources
            .iter()
            .filter(|((t, rt, _), _)| t == tenant && rt == resource_type)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn get(
        &self,
        tenant: &TenantId,
        resource_type: &ResourceType,
        key: &ResourceKey,
    ) -> Result<Resource> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .resources
            .get(&(tenant.clone(), resource_type.clone(), key.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                resource_type: resource_type.clone(),
                key: key.clone(),
            })
    }
}

#[async_trait]
impl ResourceManager for MemoryStore {
    async fn create(&self, tenant: &TenantId, mut resource: Resource) -> Result<Resource> {
        let store_key = (tenant.clone(), resource.resource_type.clone(), resource.key.clone());
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            if inner.resources.contains_key(&store_key) {
                return Err(StoreError::AlreadyExists {
                    resource_type: resource.resource_type,
                    key: resource.key,
                });
            }
            resource.meta.version = inner.next_revision();
            inner.resources.insert(store_key, resource.clone());
        }

        self.publish(Operation::Create, tenant, &resource.resource_type, &resource.key);
        Ok(resource)
    }

    async fn update(&self, tenant: &TenantId, mut resource: Resource) -> Result<Resource> {
        let store_key = (tenant.clone(), resource.resource_type.clone(), resource.key.clone());
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let current = match inner.resources.get(&store_key) {
                Some(current) => current.meta.version.clone(),
                None => {
                    return Err(StoreError::NotFound {
                        resource_type: resource.resource_type,
                        key: resource.key,
                    })
                }
            };
            if current != resource.meta.version {
                return Err(StoreError::Conflict {
                    resource_type: resource.resource_type,
                    key: resource.key,
                    expected: resource.meta.version,
                    actual: current,
                });
            }
            resource.meta.version = inner.next_revision();
            inner.resources.insert(store_key, resource.clone());
        }

        self.publish(Operation::Update, tenant, &resource.resource_type, &resource.key);
        Ok(resource)
    }

    async fn delete(
        &self,
        tenant: &TenantId,
        resource_type: &ResourceType,
        key: &ResourceKey,
    ) -> Result<()> {
        let removed = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .resources
            .remove(&(tenant.clone(), resource_type.clone(), key.clone()));

        if removed.is_none() {
            return Err(StoreError::NotFound {
                resource_type: resource_type.clone(),
                key: key.clone(),
            });
        }

        self.publish(Operation::Delete, tenant, resource_type, key);
        Ok(())
    }
}
