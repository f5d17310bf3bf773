//! Delta discovery server: push cached snapshots to a peer.
//!
//! ## Overview
//!
//! The server side of one stream tracks which types the peer subscribed
//! to and which version of every resource it last sent
//! ([`DeltaStreamState`]). Whenever the node's cached snapshot changes,
//! each subscribed type is diffed against that state: resources whose
//! content hash moved are sent, names that disappeared are listed as
//! removed.
//!
//! ACKs and NACKs do not trigger a response by themselves; they are
//! handed to [`DeltaCallbacks`], which may invalidate the state so that
//! the next snapshot is resent in full (see [`crate::resend`]).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use meshsync_core::{canonical_bytes, Node, ResourceType, Snapshot};
use meshsync_mux::{DeltaDiscoveryRequest, DeltaDiscoveryResponse, ServerStream, WireResource};

use crate::cache::SnapshotCache;
use crate::error::Result;

/// Subscribe or unsubscribe every resource of a type.
pub const WILDCARD: &str = "*";

/// What one peer subscribed to and what it was sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaStreamState {
    pub subscribed: BTreeSet<ResourceType>,
    /// type -> resource name -> version last sent (or reported by the peer).
    pub known: BTreeMap<ResourceType, BTreeMap<String, String>>,
}

impl DeltaStreamState {
    /// Forget the versions sent for a type, keeping the names so removals
    /// are still reported. The next pass resends every resource of it.
    pub fn invalidate(&mut self, resource_type: &ResourceType) {
        if let Some(known) = self.known.get_mut(resource_type) {
            known.values_mut().for_each(String::clear);
        }
    }

    pub fn invalidate_all(&mut self) {
        self.known
            .values_mut()
            .flat_map(|known| known.values_mut())
            .for_each(String::clear);
    }
}

/// Hooks into the lifecycle of a delta stream.
#[async_trait]
pub trait DeltaCallbacks: Send + Sync {
    async fn on_stream_open(&self, _node: &Node) {}

    /// Called for every request before the server acts on it.
    async fn on_delta_request(
        &self,
        _node: &Node,
        _request: &DeltaDiscoveryRequest,
        _state: &mut DeltaStreamState,
    ) {
    }

    async fn on_delta_response(&self, _node: &Node, _response: &DeltaDiscoveryResponse) {}

    async fn on_stream_closed(&self, _node: &Node) {}
}

/// Runs callbacks in order.
#[derive(Clone, Default)]
pub struct CallbackChain(Vec<Arc<dyn DeltaCallbacks>>);

impl CallbackChain {
    pub fn new(callbacks: Vec<Arc<dyn DeltaCallbacks>>) -> Self {
        Self(callbacks)
    }

    pub fn push(&mut self, callbacks: Arc<dyn DeltaCallbacks>) {
        self.0.push(callbacks);
    }
}

#[async_trait]
impl DeltaCallbacks for CallbackChain {
    async fn on_stream_open(&self, node: &Node) {
        for cb in &self.0 {
            cb.on_stream_open(node).await;
        }
    }

    async fn on_delta_request(
        &self,
        node: &Node,
        request: &DeltaDiscoveryRequest,
        state: &mut DeltaStreamState,
    ) {
        for cb in &self.0 {
            cb.on_delta_request(node, request, state).await;
        }
    }

    async fn on_delta_response(&self, node: &Node, response: &DeltaDiscoveryResponse) {
        for cb in &self.0 {
            cb.on_delta_response(node, response).await;
        }
    }

    async fn on_stream_closed(&self, node: &Node) {
        for cb in &self.0 {
            cb.on_stream_closed(node).await;
        }
    }
}

/// Serves the snapshots of a [`SnapshotCache`] over delta streams.
#[derive(Clone)]
pub struct DeltaServer {
    cache: Arc<SnapshotCache>,
    callbacks: Arc<dyn DeltaCallbacks>,
}

impl DeltaServer {
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self {
            cache,
            callbacks: Arc::new(CallbackChain::default()),
        }
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn DeltaCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Serve `node` until the stream ends or `cancel` fires.
    ///
    /// Cancellation returns `Ok(())`; a stream failure returns its error.
    pub async fn serve(&self, stream: ServerStream, node: Node, cancel: CancellationToken) -> Result<()> {
        let mut snapshots = self.cache.watch(&node.cache_key());
        let mut stream_state = StreamState {
            stream: &stream,
            node: &node,
            callbacks: self.callbacks.as_ref(),
            state: DeltaStreamState::default(),
            initialized: BTreeSet::new(),
            nonce: 0,
        };

        self.callbacks.on_stream_open(&node).await;
        tracing::debug!(node = %node.id, "delta stream opened");

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                request = stream.recv() => {
                    let request = match request {
                        Ok(request) => request,
                        Err(e) => break Err(e.into()),
                    };
                    let snapshot = snapshots.borrow().clone();
                    if let Err(e) = stream_state.on_request(request, snapshot.as_deref()).await {
                        break Err(e);
                    }
                }
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    if let Some(snapshot) = snapshot {
                        if let Err(e) = stream_state.respond_all(&snapshot).await {
                            break Err(e);
                        }
                    }
                }
            }
        };

        self.callbacks.on_stream_closed(&node).await;
        tracing::debug!(node = %node.id, "delta stream closed");
        result
    }
}

struct StreamState<'a> {
    stream: &'a ServerStream,
    node: &'a Node,
    callbacks: &'a dyn DeltaCallbacks,
    state: DeltaStreamState,
    /// Types that already got their first response.
    initialized: BTreeSet<ResourceType>,
    nonce: u64,
}

impl StreamState<'_> {
    async fn on_request(&mut self, request: DeltaDiscoveryRequest, snapshot: Option<&Snapshot>) -> Result<()> {
        self.callbacks
            .on_delta_request(self.node, &request, &mut self.state)
            .await;

        if request.type_url.is_empty() {
            tracing::debug!(node = %self.node.id, "ignoring request without type");
            return Ok(());
        }
        let resource_type = ResourceType::new(request.type_url.as_str());

        if let Some(detail) = &request.error_detail {
            tracing::warn!(
                node = %self.node.id,
                %resource_type,
                nonce = %request.response_nonce,
                "peer rejected config: {}",
                detail.message
            );
        }

        if request.resource_names_unsubscribe.iter().any(|n| n == WILDCARD) {
            self.state.subscribed.remove(&resource_type);
            self.state.known.remove(&resource_type);
            self.initialized.remove(&resource_type);
            return Ok(());
        }

        if self.state.subscribed.contains(&resource_type) {
            return Ok(());
        }

        self.state.subscribed.insert(resource_type.clone());
        self.state
            .known
            .insert(resource_type.clone(), request.initial_resource_versions.clone());

        match snapshot {
            Some(snapshot) => self.respond(&resource_type, snapshot).await,
            None => Ok(()),
        }
    }

    async fn respond_all(&mut self, snapshot: &Snapshot) -> Result<()> {
        let types: Vec<ResourceType> = self.state.subscribed.iter().cloned().collect();
        for resource_type in types {
            self.respond(&resource_type, snapshot).await?;
        }
        Ok(())
    }

    /// Send what changed for one type. An initial response is sent even
    /// when empty, so the peer learns the full state of the type.
    async fn respond(&mut self, resource_type: &ResourceType, snapshot: &Snapshot) -> Result<()> {
        let Some(set) = snapshot.get_resources(resource_type) else {
            tracing::debug!(node = %self.node.id, %resource_type, "type not in snapshot");
            return Ok(());
        };
        let hashes = snapshot.version_map()?.get_type(resource_type);
        let known = self.state.known.entry(resource_type.clone()).or_default();

        let mut resources = Vec::new();
        for (name, resource) in &set.items {
            let version = hashes
                .and_then(|h| h.get(name))
                .map(|h| h.to_hex())
                .unwrap_or_default();
            if known.get(name) == Some(&version) && !version.is_empty() {
                continue;
            }
            resources.push(WireResource {
                name: name.clone(),
                version,
                resource: Bytes::from(canonical_bytes(resource)?),
            });
        }
        let removed: Vec<String> = known
            .keys()
            .filter(|name| !set.items.contains_key(*name))
            .cloned()
            .collect();

        let initial = self.initialized.insert(resource_type.clone());
        if resources.is_empty() && removed.is_empty() && !initial {
            return Ok(());
        }

        for wire in &resources {
            known.insert(wire.name.clone(), wire.version.clone());
        }
        for name in &removed {
            known.remove(name);
        }

        self.nonce += 1;
        let response = DeltaDiscoveryResponse {
            system_version_info: set.version.clone(),
            resources,
            type_url: resource_type.to_string(),
            removed_resources: removed,
            nonce: self.nonce.to_string(),
        };
        tracing::trace!(
            node = %self.node.id,
            %resource_type,
            nonce = %response.nonce,
            added = response.resources.len(),
            removed = response.removed_resources.len(),
            "sending delta response"
        );
        self.callbacks.on_delta_response(self.node, &response).await;
        self.stream.send(response).await?;
        Ok(())
    }
}
