//! Proptest generators for property-based testing.

use std::collections::BTreeMap;

use proptest::prelude::*;
use serde_json::{json, Value};

use meshsync_core::{Resource, ResourceKey, ResourceType};

use crate::fixtures::{DATAPLANE, MESH, TRAFFIC_POLICY};

/// One of the fixture resource types.
pub fn resource_type() -> impl Strategy<Value = ResourceType> {
    prop_oneof![
        Just(ResourceType::new(MESH)),
        Just(ResourceType::new(TRAFFIC_POLICY)),
        Just(ResourceType::new(DATAPLANE)),
    ]
}

/// A DNS-label style resource name.
pub fn resource_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,15}".prop_map(String::from)
}

/// A mesh name, or empty for global resources.
pub fn mesh_name() -> impl Strategy<Value = String> {
    prop_oneof![Just(String::new()), Just("default".to_string()), resource_name()]
}

pub fn labels() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map("[a-z]{1,8}(/[a-z]{1,8})?", "[a-z0-9]{0,8}", 0..4)
}

/// A small JSON object.
pub fn spec() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z]{1,6}", any::<i32>(), 0..5).prop_map(|fields| json!(fields))
}

/// A resource of any fixture type.
pub fn resource() -> impl Strategy<Value = Resource> {
    (resource_type(), resource_name(), mesh_name(), labels(), spec()).prop_map(
        |(resource_type, name, mesh, labels, spec)| {
            let mut resource = Resource::new(resource_type, ResourceKey::new(name, mesh), spec);
            resource.meta.labels = labels;
            resource
        },
    )
}

/// Up to `max` resources of one type with distinct keys.
pub fn resources_of(resource_type: ResourceType, max: usize) -> impl Strategy<Value = Vec<Resource>> {
    prop::collection::btree_map((resource_name(), mesh_name()), (labels(), spec()), 0..=max).prop_map(
        move |entries| {
            entries
                .into_iter()
                .map(|((name, mesh), (labels, spec))| {
                    let mut resource =
                        Resource::new(resource_type.clone(), ResourceKey::new(name, mesh), spec);
                    resource.meta.labels = labels;
                    resource
                })
                .collect()
        },
    )
}
