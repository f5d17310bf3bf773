//! Resource managers for exercising failure paths.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use meshsync_core::{Resource, ResourceKey, ResourceType, TenantId};
use meshsync_store::{MemoryStore, ReadOnlyResourceManager, ResourceManager, Result, StoreError};

/// A [`MemoryStore`] that fails on demand.
///
/// Operations on a failing type, or on any type while the whole store is
/// unavailable, return [`StoreError::Unavailable`].
pub struct FailingStore {
    inner: MemoryStore,
    unavailable: AtomicBool,
    failing: Mutex<BTreeSet<ResourceType>>,
}

impl FailingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            unavailable: AtomicBool::new(false),
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    /// Fail every operation on `resource_type`.
    pub fn fail_type(&self, resource_type: impl Into<ResourceType>) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource_type.into());
    }

    /// Fail every operation.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Stop failing.
    pub fn heal(&self) {
        self.set_unavailable(false);
        self.failing.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn check(&self, resource_type: &ResourceType) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is down".into()));
        }
        let failing = self.failing.lock().unwrap_or_else(PoisonError::into_inner);
        if failing.contains(resource_type) {
            return Err(StoreError::Unavailable(format!("{resource_type} is failing")));
        }
        Ok(())
    }
}

#[async_trait]
impl ReadOnlyResourceManager for FailingStore {
    async fn list(&self, tenant: &TenantId, resource_type: &ResourceType) -> Result<Vec<Resource>> {
        self.check(resource_type)?;
        self.inner.list(tenant, resource_type).await
    }

    async fn get(
        &self,
        tenant: &TenantId,
        resource_type: &ResourceType,
        key: &ResourceKey,
    ) -> Result<Resource> {
        self.check(resource_type)?;
        self.inner.get(tenant, resource_type, key).await
    }
}

#[async_trait]
impl ResourceManager for FailingStore {
    async fn create(&self, tenant: &TenantId, resource: Resource) -> Result<Resource> {
        self.check(&resource.resource_type)?;
        self.inner.create(tenant, resource).await
    }

    async fn update(&self, tenant: &TenantId, resource: Resource) -> Result<Resource> {
        self.check(&resource.resource_type)?;
        self.inner.update(tenant, resource).await
    }

    async fn delete(
        &self,
        tenant: &TenantId,
        resource_type: &ResourceType,
        key: &ResourceKey,
    ) -> Result<()> {
        self.check(resource_type)?;
        self.inner.delete(tenant, resource_type, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::mesh;

    #[tokio::test]
    async fn test_fails_only_while_configured() {
        let store = FailingStore::new(MemoryStore::new());
        let tenant = TenantId::default_tenant();
        store.create(&tenant, mesh("default")).await.unwrap();

        store.fail_type("Mesh");
        assert!(matches!(
            store.list(&tenant, &ResourceType::new("Mesh")).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.list(&tenant, &ResourceType::new("Other")).await.is_ok());

        store.heal();
        store.set_unavailable(true);
        assert!(store.list(&tenant, &ResourceType::new("Other")).await.is_err());

        store.heal();
        assert_eq!(store.list(&tenant, &ResourceType::new("Mesh")).await.unwrap().len(), 1);
    }
}
