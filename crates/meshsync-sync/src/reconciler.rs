//! Reconciliation: turn store contents into a versioned, cached snapshot.
//!
//! ## Overview
//!
//! A reconcile pass regenerates the changed types of a node, carries the
//! other types over from the cached snapshot, versions the result against
//! the cached one and writes it back only if some version moved. Nothing
//! is retried here: the watchdog calls again on its next tick.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use meshsync_core::{Node, ResourceType, Snapshot, SnapshotVersioner};

use crate::cache::SnapshotCache;
use crate::error::Result;
use crate::generator::SnapshotGenerator;
use crate::metrics::SyncMetrics;

/// Keeps the cached snapshot of a node in line with the store.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Rebuild `changed_types` for `node`.
    ///
    /// Returns `false` when the result equals the cached snapshot, in
    /// which case nothing was written.
    async fn reconcile(&self, node: &Node, changed_types: &BTreeSet<ResourceType>) -> Result<bool>;

    /// Drop the snapshot of a node whose stream ended.
    async fn clear(&self, node: &Node);

    /// Make the next reconcile mint a new version for `resource_type`
    /// even if its resources did not change.
    fn force_version(&self, node: &Node, resource_type: &ResourceType);

    /// Types waiting for a forced version.
    fn forced_types(&self, _node: &Node) -> BTreeSet<ResourceType> {
        BTreeSet::new()
    }
}

/// Reconciler writing into a [`SnapshotCache`].
pub struct SnapshotReconciler {
    generator: Arc<dyn SnapshotGenerator>,
    cache: Arc<SnapshotCache>,
    versioner: SnapshotVersioner,
    metrics: Arc<SyncMetrics>,
    forced: Mutex<HashMap<String, BTreeSet<ResourceType>>>,
}

impl SnapshotReconciler {
    pub fn new(
        generator: Arc<dyn SnapshotGenerator>,
        cache: Arc<SnapshotCache>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            generator,
            cache,
            versioner: SnapshotVersioner::new(),
            metrics,
            forced: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_versioner(mut self, versioner: SnapshotVersioner) -> Self {
        self.versioner = versioner;
        self
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn supported_types(&self) -> &BTreeSet<ResourceType> {
        self.generator.supported_types()
    }

    fn pending_forced(&self, key: &str) -> BTreeSet<ResourceType> {
        self.forced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn release_forced(&self, key: &str, done: &BTreeSet<ResourceType>) {
        let mut forced = self.forced.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = forced.get_mut(key) {
            pending.retain(|t| !done.contains(t));
            if pending.is_empty() {
                forced.remove(key);
            }
        }
    }
}

#[async_trait]
impl Reconciler for SnapshotReconciler {
    async fn reconcile(&self, node: &Node, changed_types: &BTreeSet<ResourceType>) -> Result<bool> {
        let key = node.cache_key();
        let supported = self.generator.supported_types();
        let old = self.cache.get_snapshot(&key);
        let forced = self.pending_forced(&key);

        let to_generate: BTreeSet<ResourceType> = match &old {
            None => supported.clone(),
            Some(_) => changed_types
                .iter()
                .chain(forced.iter())
                .filter(|t| supported.contains(*t))
                .cloned()
                .collect(),
        };

        let fresh = self.generator.generate_snapshot(node, &to_generate).await?;
        let sets = supported.iter().filter_map(|t| {
            let source = if to_generate.contains(t) {
                Some(&fresh)
            } else {
                old.as_deref()
            };
            source
                .and_then(|s| s.get_resources(t))
                .map(|set| (t.clone(), set.clone()))
        });
        let merged = Snapshot::from_parts(supported.iter().cloned(), sets);
        merged.consistent()?;

        let versioned = self.versioner.version_forced(merged, old.as_deref(), &forced);

        let new_versions = versioned.versions();
        let old_versions = old.as_ref().map(|s| s.versions()).unwrap_or_default();
        if old.is_some() && new_versions == old_versions {
            self.metrics.record_reconciliation(false);
            return Ok(false);
        }

        self.cache.set_snapshot(&key, versioned);
        for (resource_type, version) in &new_versions {
            if old_versions.get(resource_type) != Some(version) {
                self.metrics.record_generation(resource_type);
                tracing::debug!(node = %node.id, %resource_type, %version, "config ready for delivery");
            }
        }
        self.release_forced(&key, &forced);
        self.metrics.record_reconciliation(true);
        Ok(true)
    }

    async fn clear(&self, node: &Node) {
        let key = node.cache_key();
        self.forced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);

        if let Some(snapshot) = self.cache.clear_snapshot(&key) {
            for (resource_type, version) in snapshot.versions() {
                if !version.is_empty() {
                    self.metrics.record_discard(&resource_type);
                }
            }
        }
    }

    fn force_version(&self, node: &Node, resource_type: &ResourceType) {
        self.forced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(node.cache_key())
            .or_default()
            .insert(resource_type.clone());
    }

    fn forced_types(&self, node: &Node) -> BTreeSet<ResourceType> {
        self.pending_forced(&node.cache_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::StoreSnapshotGenerator;
    use meshsync_core::{Resource, ResourceKey, TenantId};
    use meshsync_store::{MemoryStore, ReadOnlyResourceManager, ResourceManager};
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn mesh() -> ResourceType {
        ResourceType::new("Mesh")
    }

    fn policy() -> ResourceType {
        ResourceType::new("TrafficPolicy")
    }

    fn all() -> BTreeSet<ResourceType> {
        [mesh(), policy()].into_iter().collect()
    }

    fn counting_versioner() -> SnapshotVersioner {
        let next = Arc::new(AtomicU64::new(0));
        SnapshotVersioner::with_generator(move || format!("v{}", next.fetch_add(1, Ordering::SeqCst)))
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        reconciler: SnapshotReconciler,
        metrics: Arc<SyncMetrics>,
        node: Node,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let tenant = TenantId::default_tenant();
        store
            .create(&tenant, Resource::new(mesh(), ResourceKey::global("default"), json!({})))
            .await
            .unwrap();
        store
            .create(
                &tenant,
                Resource::new(policy(), ResourceKey::new("p1", "default"), json!({ "retries": 1 })),
            )
            .await
            .unwrap();

        let generator = Arc::new(StoreSnapshotGenerator::new(store.clone(), all()));
        let metrics = Arc::new(SyncMetrics::new());
        let reconciler = SnapshotReconciler::new(generator, Arc::new(SnapshotCache::new()), metrics.clone())
            .with_versioner(counting_versioner());

        Fixture {
            store,
            reconciler,
            metrics,
            node: Node::new("zone-1", tenant),
        }
    }

    fn cached(f: &Fixture) -> Arc<Snapshot> {
        f.reconciler.cache().get_snapshot(&f.node.cache_key()).unwrap()
    }

    #[tokio::test]
    async fn test_first_reconcile_builds_everything() {
        let f = fixture().await;
        assert!(f.reconciler.reconcile(&f.node, &BTreeSet::new()).await.unwrap());

        let snapshot = cached(&f);
        assert_eq!(snapshot.resource_count(), 2);
        assert!(snapshot.versions().values().all(|v| !v.is_empty()));
        assert_eq!(f.metrics.generations(&mesh()), 1);
        assert_eq!(f.metrics.generations(&policy()), 1);
    }

    #[tokio::test]
    async fn test_reconcile_without_change_is_noop() {
        let f = fixture().await;
        f.reconciler.reconcile(&f.node, &all()).await.unwrap();
        let before = cached(&f).versions();

        assert!(!f.reconciler.reconcile(&f.node, &all()).await.unwrap());
        assert_eq!(cached(&f).versions(), before);
        assert_eq!(f.metrics.unchanged(), 1);
        assert_eq!(f.metrics.generations(&mesh()), 1);
    }

    #[tokio::test]
    async fn test_change_moves_only_that_type() {
        let f = fixture().await;
        f.reconciler.reconcile(&f.node, &all()).await.unwrap();
        let before = cached(&f).versions();

        let tenant = TenantId::default_tenant();
        let mut p1 = f
            .store
            .get(&tenant, &policy(), &ResourceKey::new("p1", "default"))
            .await
            .unwrap();
        p1.spec = json!({ "retries": 5 });
        f.store.update(&tenant, p1).await.unwrap();

        assert!(f.reconciler.reconcile(&f.node, &all()).await.unwrap());
        let after = cached(&f).versions();
        assert_eq!(after[&mesh()], before[&mesh()]);
        assert_ne!(after[&policy()], before[&policy()]);
        assert_eq!(f.metrics.generations(&policy()), 2);
        assert_eq!(f.metrics.generations(&mesh()), 1);
    }

    #[tokio::test]
    async fn test_types_not_requested_are_carried_over() {
        let f = fixture().await;
        f.reconciler.reconcile(&f.node, &all()).await.unwrap();

        let tenant = TenantId::default_tenant();
        f.store
            .create(&tenant, Resource::new(policy(), ResourceKey::new("p2", "default"), json!({})))
            .await
            .unwrap();

        // Only Mesh is dirty, so the new policy is not picked up yet.
        let only_mesh = [mesh()].into_iter().collect();
        assert!(!f.reconciler.reconcile(&f.node, &only_mesh).await.unwrap());
        assert_eq!(cached(&f).get_resources(&policy()).unwrap().len(), 1);

        let only_policy = [policy()].into_iter().collect();
        assert!(f.reconciler.reconcile(&f.node, &only_policy).await.unwrap());
        assert_eq!(cached(&f).get_resources(&policy()).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_forced_version_changes_without_resource_change() {
        let f = fixture().await;
        f.reconciler.reconcile(&f.node, &all()).await.unwrap();
        let before = cached(&f).versions();

        f.reconciler.force_version(&f.node, &mesh());
        assert_eq!(f.reconciler.forced_types(&f.node), [mesh()].into_iter().collect());

        assert!(f.reconciler.reconcile(&f.node, &BTreeSet::new()).await.unwrap());
        let after = cached(&f).versions();
        assert_ne!(after[&mesh()], before[&mesh()]);
        assert_eq!(after[&policy()], before[&policy()]);
        assert!(f.reconciler.forced_types(&f.node).is_empty());

        assert!(!f.reconciler.reconcile(&f.node, &all()).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_discards_versions() {
        let f = fixture().await;
        f.reconciler.reconcile(&f.node, &all()).await.unwrap();

        f.reconciler.clear(&f.node).await;
        assert!(!f.reconciler.cache().has_snapshot(&f.node.cache_key()));
        assert_eq!(f.metrics.discards(&mesh()), 1);
        assert_eq!(f.metrics.discards(&policy()), 1);

        // Clearing twice is harmless.
        f.reconciler.clear(&f.node).await;
        assert_eq!(f.metrics.discards(&mesh()), 1);
    }

    #[tokio::test]
    async fn test_nodes_are_isolated() {
        let f = fixture().await;
        let other = Node::new("zone-2", TenantId::default_tenant());

        f.reconciler.reconcile(&f.node, &all()).await.unwrap();
        f.reconciler.reconcile(&other, &all()).await.unwrap();
        f.reconciler.clear(&f.node).await;

        assert!(f.reconciler.cache().has_snapshot(&other.cache_key()));
    }
}
