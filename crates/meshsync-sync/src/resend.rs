//! Forced resend after a NACK.
//!
//! Delta discovery does not resend an unchanged payload after a NACK, so a
//! peer that rejected config because of a transient failure would never
//! get it again. [`ResendForcer`] reacts to a NACK by forgetting what was
//! sent for the rejected type and asking the reconciler for a new version
//! of it. The snapshot contents are never touched; the next snapshot
//! simply differs from what the stream believes the peer holds.

use std::sync::Arc;

use async_trait::async_trait;

use meshsync_core::{Node, ResourceType};
use meshsync_mux::DeltaDiscoveryRequest;

use crate::reconciler::Reconciler;
use crate::server::{DeltaCallbacks, DeltaStreamState};

pub struct ResendForcer {
    reconciler: Arc<dyn Reconciler>,
}

impl ResendForcer {
    pub fn new(reconciler: Arc<dyn Reconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl DeltaCallbacks for ResendForcer {
    async fn on_delta_request(
        &self,
        node: &Node,
        request: &DeltaDiscoveryRequest,
        state: &mut DeltaStreamState,
    ) {
        if !request.is_nack() {
            return;
        }

        if request.type_url.is_empty() {
            state.invalidate_all();
            for resource_type in state.subscribed.clone() {
                self.reconciler.force_version(node, &resource_type);
            }
        } else {
            let resource_type = ResourceType::new(request.type_url.as_str());
            state.invalidate(&resource_type);
            self.reconciler.force_version(node, &resource_type);
        }
        tracing::debug!(node = %node.id, type_url = %request.type_url, "forcing resend after NACK");
    }
}
