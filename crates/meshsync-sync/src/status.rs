//! Per-peer delivery statistics, collected through [`DeltaCallbacks`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use meshsync_core::{Node, ResourceType};
use meshsync_mux::{DeltaDiscoveryRequest, DeltaDiscoveryResponse};

use crate::server::{DeltaCallbacks, DeltaStreamState};

/// Delivery counters of one type on one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeStats {
    pub responses_sent: u64,
    pub acks: u64,
    pub nacks: u64,
    /// Version of the last response sent.
    pub last_version: String,
    /// Message of the last NACK, cleared by the next ACK.
    pub last_error: Option<String>,
}

/// Delivery state of every connected peer.
#[derive(Debug, Default)]
pub struct StatusTracker {
    peers: RwLock<HashMap<String, BTreeMap<ResourceType, TypeStats>>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stats of a connected peer, `None` once its stream closed.
    pub fn peer(&self, peer_id: &str) -> Option<BTreeMap<ResourceType, TypeStats>> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .cloned()
    }

    pub fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        peers.sort();
        peers
    }

    fn update(&self, peer_id: &str, resource_type: ResourceType, f: impl FnOnce(&mut TypeStats)) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(types) = peers.get_mut(peer_id) {
            f(types.entry(resource_type).or_default());
        }
    }
}

#[async_trait]
impl DeltaCallbacks for StatusTracker {
    async fn on_stream_open(&self, node: &Node) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.id.clone(), BTreeMap::new());
    }

    async fn on_delta_request(&self, node: &Node, request: &DeltaDiscoveryRequest, _: &mut DeltaStreamState) {
        if request.response_nonce.is_empty() || request.type_url.is_empty() {
            return;
        }
        let resource_type = ResourceType::new(request.type_url.as_str());
        self.update(&node.id, resource_type, |stats| match &request.error_detail {
            Some(detail) => {
                stats.nacks += 1;
                stats.last_error = Some(detail.message.clone());
            }
            None => {
                stats.acks += 1;
                stats.last_error = None;
            }
        });
    }

    async fn on_delta_response(&self, node: &Node, response: &DeltaDiscoveryResponse) {
        let resource_type = ResourceType::new(response.type_url.as_str());
        self.update(&node.id, resource_type, |stats| {
            stats.responses_sent += 1;
            stats.last_version = response.system_version_info.clone();
        });
    }

    async fn on_stream_closed(&self, node: &Node) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&node.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsync_core::TenantId;
    use meshsync_mux::ErrorDetail;

    #[tokio::test]
    async fn test_tracks_responses_acks_and_nacks() {
        let tracker = StatusTracker::new();
        let node = Node::new("zone-1", TenantId::default_tenant());
        let mut state = DeltaStreamState::default();
        let mesh = ResourceType::new("Mesh");

        tracker.on_stream_open(&node).await;
        tracker
            .on_delta_response(
                &node,
                &DeltaDiscoveryResponse {
                    type_url: "Mesh".into(),
                    system_version_info: "v1".into(),
                    nonce: "1".into(),
                    ..Default::default()
                },
            )
            .await;
        let nack = DeltaDiscoveryRequest {
            type_url: "Mesh".into(),
            response_nonce: "1".into(),
            error_detail: Some(ErrorDetail::internal("bad spec")),
            ..Default::default()
        };
        tracker.on_delta_request(&node, &nack, &mut state).await;

        let stats = tracker.peer("zone-1").unwrap()[&mesh].clone();
        assert_eq!(stats.responses_sent, 1);
        assert_eq!(stats.last_version, "v1");
        assert_eq!(stats.nacks, 1);
        assert_eq!(stats.last_error.as_deref(), Some("bad spec"));

        let ack = DeltaDiscoveryRequest {
            type_url: "Mesh".into(),
            response_nonce: "2".into(),
            ..Default::default()
        };
        tracker.on_delta_request(&node, &ack, &mut state).await;
        let stats = tracker.peer("zone-1").unwrap()[&mesh].clone();
        assert_eq!(stats.acks, 1);
        assert_eq!(stats.last_error, None);

        tracker.on_stream_closed(&node).await;
        assert!(tracker.peer("zone-1").is_none());
        assert!(tracker.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_subscriptions_are_not_counted() {
        let tracker = StatusTracker::new();
        let node = Node::new("zone-1", TenantId::default_tenant());
        tracker.on_stream_open(&node).await;

        let subscribe = DeltaDiscoveryRequest {
            type_url: "Mesh".into(),
            ..Default::default()
        };
        tracker
            .on_delta_request(&node, &subscribe, &mut DeltaStreamState::default())
            .await;

        assert!(tracker.peer("zone-1").unwrap().is_empty());
    }
}
