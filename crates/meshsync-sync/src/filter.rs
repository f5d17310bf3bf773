//! Resource filters and mappers applied while generating snapshots.
//!
//! A [`ResourceFilter`] decides whether a peer gets a resource at all; a
//! [`ResourceMapper`] rewrites a resource for the peer (for example to
//! stamp origin labels, or to adapt it to an older feature set). Both are
//! composable:
//!
//! ```rust,ignore
//! let filter = CompositeFilter::new(vec![Arc::new(zone_provided_filter()), Arc::new(skip_types)]);
//! let mapper = CompositeMapper::new(vec![
//!     Arc::new(WithLabel::new(ORIGIN_LABEL, ORIGIN_ZONE)),
//!     Arc::new(When::new(type_is("Secret"), RemoveNameSuffix::new(".mesh-system"))),
//! ]);
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use meshsync_core::{hashed_name, Features, Resource, ResourceType};

/// Label naming where a resource was created.
pub const ORIGIN_LABEL: &str = "meshsync.io/origin";
/// Label naming the zone a zone-originated resource comes from.
pub const ZONE_LABEL: &str = "meshsync.io/zone";

/// Label holding the name a peer knows a renamed resource by.
pub const DISPLAY_NAME_LABEL: &str = "meshsync.io/display-name";

pub const ORIGIN_GLOBAL: &str = "global";
pub const ORIGIN_ZONE: &str = "zone";

/// Decides whether a resource is sent to a peer.
#[async_trait]
pub trait ResourceFilter: Send + Sync {
    async fn filter(&self, peer_id: &str, features: &Features, resource: &Resource) -> bool;
}

#[async_trait]
impl<F> ResourceFilter for F
where
    F: Fn(&str, &Features, &Resource) -> bool + Send + Sync,
{
    async fn filter(&self, peer_id: &str, features: &Features, resource: &Resource) -> bool {
        self(peer_id, features, resource)
    }
}

/// Rewrites a resource before it is sent to a peer.
pub trait ResourceMapper: Send + Sync {
    fn map(&self, features: &Features, resource: Resource) -> anyhow::Result<Resource>;
}

impl<F> ResourceMapper for F
where
    F: Fn(&Features, Resource) -> anyhow::Result<Resource> + Send + Sync,
{
    fn map(&self, features: &Features, resource: Resource) -> anyhow::Result<Resource> {
        self(features, resource)
    }
}

/// A condition on a resource, used by [`When`].
pub type ResourcePredicate = Arc<dyn Fn(&Features, &Resource) -> bool + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Filters
// ─────────────────────────────────────────────────────────────────────────────

/// Accepts every resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl ResourceFilter for AcceptAll {
    async fn filter(&self, _: &str, _: &Features, _: &Resource) -> bool {
        true
    }
}

/// Accepts a resource only if every inner filter accepts it.
#[derive(Clone, Default)]
pub struct CompositeFilter {
    filters: Vec<Arc<dyn ResourceFilter>>,
}

impl CompositeFilter {
    pub fn new(filters: Vec<Arc<dyn ResourceFilter>>) -> Self {
        Self { filters }
    }
}

#[async_trait]
impl ResourceFilter for CompositeFilter {
    async fn filter(&self, peer_id: &str, features: &Features, resource: &Resource) -> bool {
        for filter in &self.filters {
            if !filter.filter(peer_id, features, resource).await {
                return false;
            }
        }
        true
    }
}

/// Resources created on this zone, sent from zone to global.
pub fn zone_provided_filter() -> impl ResourceFilter {
    |_: &str, _: &Features, r: &Resource| r.label(ORIGIN_LABEL) == Some(ORIGIN_ZONE)
}

/// Resources not originated by a zone, sent from global to zones.
pub fn global_provided_filter() -> impl ResourceFilter {
    |_: &str, _: &Features, r: &Resource| r.label(ORIGIN_LABEL) != Some(ORIGIN_ZONE)
}

// ─────────────────────────────────────────────────────────────────────────────
// Mappers
// ─────────────────────────────────────────────────────────────────────────────

/// Returns resources unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl ResourceMapper for Identity {
    fn map(&self, _: &Features, resource: Resource) -> anyhow::Result<Resource> {
        Ok(resource)
    }
}

/// Applies mappers in order. The first error stops the chain.
#[derive(Clone, Default)]
pub struct CompositeMapper {
    mappers: Vec<Arc<dyn ResourceMapper>>,
}

impl CompositeMapper {
    pub fn new(mappers: Vec<Arc<dyn ResourceMapper>>) -> Self {
        Self { mappers }
    }
}

impl ResourceMapper for CompositeMapper {
    fn map(&self, features: &Features, resource: Resource) -> anyhow::Result<Resource> {
        self.mappers
            .iter()
            .try_fold(resource, |r, mapper| mapper.map(features, r))
    }
}

/// Applies a mapper only when a predicate holds.
pub struct When<M> {
    predicate: ResourcePredicate,
    mapper: M,
}

impl<M: ResourceMapper> When<M> {
    pub fn new(predicate: ResourcePredicate, mapper: M) -> Self {
        Self { predicate, mapper }
    }
}

impl<M: ResourceMapper> ResourceMapper for When<M> {
    fn map(&self, features: &Features, resource: Resource) -> anyhow::Result<Resource> {
        if (self.predicate)(features, &resource) {
            self.mapper.map(features, resource)
        } else {
            Ok(resource)
        }
    }
}

/// Sets a label.
#[derive(Debug, Clone)]
pub struct WithLabel {
    key: String,
    value: String,
}

impl WithLabel {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl ResourceMapper for WithLabel {
    fn map(&self, _: &Features, resource: Resource) -> anyhow::Result<Resource> {
        Ok(resource.with_label(self.key.clone(), self.value.clone()))
    }
}

/// Drops labels whose key starts with any of the prefixes.
#[derive(Debug, Clone)]
pub struct WithoutLabelPrefixes {
    prefixes: Vec<String>,
}

impl WithoutLabelPrefixes {
    pub fn new(prefixes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }
}

impl ResourceMapper for WithoutLabelPrefixes {
    fn map(&self, _: &Features, mut resource: Resource) -> anyhow::Result<Resource> {
        resource
            .meta
            .labels
            .retain(|k, _| !self.prefixes.iter().any(|p| k.starts_with(p.as_str())));
        Ok(resource)
    }
}

/// Strips a suffix from resource names, e.g. a storage namespace.
#[derive(Debug, Clone)]
pub struct RemoveNameSuffix {
    suffix: String,
}

impl RemoveNameSuffix {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }
}

impl ResourceMapper for RemoveNameSuffix {
    fn map(&self, _: &Features, mut resource: Resource) -> anyhow::Result<Resource> {
        if let Some(stripped) = resource.key.name.strip_suffix(self.suffix.as_str()) {
            resource.key.name = stripped.to_string();
        }
        Ok(resource)
    }
}

/// Appends a hash of the mesh, the name and the values of `labels` to
/// resource names, so that resources of the same name owned by different
/// zones do not overwrite each other.
#[derive(Debug, Clone)]
pub struct HashSuffix {
    labels: Vec<String>,
}

impl HashSuffix {
    pub fn new(labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }
}

impl ResourceMapper for HashSuffix {
    fn map(&self, _: &Features, mut resource: Resource) -> anyhow::Result<Resource> {
        let values: Vec<&str> = self
            .labels
            .iter()
            .filter_map(|label| resource.label(label))
            .collect();
        let name = hashed_name(&resource.key.mesh, &resource.key.name, &values);
        resource.key.name = name;
        Ok(resource)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Predicates
// ─────────────────────────────────────────────────────────────────────────────

pub fn type_is(resource_type: impl Into<String>) -> ResourcePredicate {
    let resource_type = ResourceType::new(resource_type);
    Arc::new(move |_, r| r.resource_type == resource_type)
}

pub fn name_has_prefix(prefix: impl Into<String>) -> ResourcePredicate {
    let prefix = prefix.into();
    Arc::new(move |_, r| r.key.name.starts_with(prefix.as_str()))
}

pub fn has_feature(feature: impl Into<String>) -> ResourcePredicate {
    let feature = feature.into();
    Arc::new(move |features, _| features.has(&feature))
}

pub fn and(a: ResourcePredicate, b: ResourcePredicate) -> ResourcePredicate {
    Arc::new(move |f, r| a(f, r) && b(f, r))
}

pub fn not(p: ResourcePredicate) -> ResourcePredicate {
    Arc::new(move |f, r| !p(f, r))
}
