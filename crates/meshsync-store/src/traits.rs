//! Resource manager traits: the abstract interface to resource storage.
//!
//! The sync engine only reads through [`ReadOnlyResourceManager`]; writers
//! (health checks, the zone-to-global sink) go through [`ResourceManager`].
//! Implementations must support many concurrent readers.

use async_trait::async_trait;

use meshsync_core::{Resource, ResourceKey, ResourceType, TenantId};

use crate::error::{Result, StoreError};

/// Read access to resources, scoped by tenant.
#[async_trait]
pub trait ReadOnlyResourceManager: Send + Sync {
    /// List every resource of one type.
    async fn list(&self, tenant: &TenantId, resource_type: &ResourceType) -> Result<Vec<Resource>>;

    /// Get one resource. Missing resources are [`StoreError::NotFound`].
    async fn get(
        &self,
        tenant: &TenantId,
        resource_type: &ResourceType,
        key: &ResourceKey,
    ) -> Result<Resource>;
}

/// Full CRUD access. Mutations publish `ResourceChanged` events.
#[async_trait]
pub trait ResourceManager: ReadOnlyResourceManager {
    /// Create a resource. Fails with `AlreadyExists` if the key is taken.
    async fn create(&self, tenant: &TenantId, resource: Resource) -> Result<Resource>;

    /// Update a resource.
    ///
    /// `resource.meta.version` must equal the stored version, otherwise the
    /// update fails with `Conflict`.
    async fn update(&self, tenant: &TenantId, resource: Resource) -> Result<Resource>;

    /// Delete a resource.
    async fn delete(
        &self,
        tenant: &TenantId,
        resource_type: &ResourceType,
        key: &ResourceKey,
    ) -> Result<()>;
}

/// Get-or-create a resource and apply `mutate` to it.
///
/// Version conflicts are retried up to `max_retries` times, re-reading the
/// resource each time.
pub async fn upsert<M, F>(
    manager: &M,
    tenant: &TenantId,
    resource_type: &ResourceType,
    key: &ResourceKey,
    max_retries: usize,
    mut mutate: F,
) -> Result<Resource>
where
    M: ResourceManager + ?Sized,
    F: FnMut(&mut Resource) + Send,
{
    let mut attempt = 0;
    loop {
        let result = match manager.get(tenant, resource_type, key).await {
            Ok(mut existing) => {
                mutate(&mut existing);
                manager.update(tenant, existing).await
            }
            Err(e) if e.is_not_found() => {
                let mut fresh = Resource::new(
                    resource_type.clone(),
                    key.clone(),
                    serde_json::Value::Object(Default::default()),
                );
                mutate(&mut fresh);
                manager.create(tenant, fresh).await
            }
            Err(e) => return Err(e),
        };

        match result {
            Err(e @ (StoreError::Conflict { .. } | StoreError::AlreadyExists { .. }))
                if attempt < max_retries =>
            {
                attempt += 1;
                tracing::debug!(%resource_type, %key, attempt, "upsert conflict, retrying: {}", e);
            }
            other => return other,
        }
    }
}
