//! The per-stream driver shared by the global and zone sides.
//!
//! An [`Endpoint`] owns what one control plane needs to sync with its
//! peers: the snapshot cache, the reconciler behind it, the delta server
//! and the metrics. [`Endpoint::drive`] runs one session until it ends.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use meshsync_core::{Node, ResourceType};
use meshsync_events::{EventBus, Listener};
use meshsync_mux::{NodeInfo, Session};
use meshsync_store::{ReadOnlyResourceManager, ResourceManager};
use meshsync_sync::{
    CallbackChain, DeltaCallbacks, DeltaServer, DeltaSyncClient, EventBasedWatchdog,
    IntervalWatchdog, Reconciler, ResendForcer, ResourceFilter, ResourceSyncer, SnapshotCache,
    SnapshotReconciler, StatusTracker, StoreSnapshotGenerator, SyncMetrics, Watchdog,
};

use crate::config::SyncConfig;
use crate::error::{MeshSyncError, Result};

/// What one session carries.
pub(crate) struct Roles {
    /// Serve our provided types to the peer.
    pub serve: bool,
    /// Subscribe to the peer's types and store them.
    pub consume: Option<Consumer>,
}

/// The client role of a session.
pub(crate) struct Consumer {
    pub node: NodeInfo,
    pub syncer: Arc<dyn ResourceSyncer>,
}

pub(crate) struct Endpoint {
    pub manager: Arc<dyn ResourceManager>,
    pub reader: Arc<dyn ReadOnlyResourceManager>,
    pub bus: EventBus,
    pub cache: Arc<SnapshotCache>,
    pub reconciler: Arc<SnapshotReconciler>,
    pub server: DeltaServer,
    pub status: Arc<StatusTracker>,
    pub metrics: Arc<SyncMetrics>,
    pub provided: BTreeSet<ResourceType>,
    pub consumed: BTreeSet<ResourceType>,
    pub config: SyncConfig,
    pub shutdown: CancellationToken,
}

impl Endpoint {
    pub fn new<M>(
        manager: Arc<M>,
        bus: EventBus,
        provided: BTreeSet<ResourceType>,
        consumed: BTreeSet<ResourceType>,
        filter: Arc<dyn ResourceFilter>,
        config: SyncConfig,
    ) -> Result<Self>
    where
        M: ResourceManager + 'static,
    {
        config.validate()?;

        let reader: Arc<dyn ReadOnlyResourceManager> = manager.clone();
        let manager: Arc<dyn ResourceManager> = manager;
        let metrics = Arc::new(SyncMetrics::new());
        let cache = Arc::new(SnapshotCache::new());

        let generator = StoreSnapshotGenerator::new(reader.clone(), provided.iter().cloned()).with_filter(filter);
        let reconciler = Arc::new(SnapshotReconciler::new(Arc::new(generator), cache.clone(), metrics.clone()));

        let status = Arc::new(StatusTracker::new());
        let resend: Arc<dyn DeltaCallbacks> = Arc::new(ResendForcer::new(reconciler.clone()));
        let callbacks = CallbackChain::new(vec![resend, status.clone()]);
        let server = DeltaServer::new(cache.clone()).with_callbacks(Arc::new(callbacks));

        Ok(Self {
            manager,
            reader,
            bus,
            cache,
            reconciler,
            server,
            status,
            metrics,
            provided,
            consumed,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    fn watchdog(&self, node: Node) -> Box<dyn Watchdog> {
        let reconciler: Arc<dyn Reconciler> = self.reconciler.clone();
        if self.config.use_event_based_watchdog {
            Box::new(EventBasedWatchdog::new(
                node,
                reconciler,
                self.provided.clone(),
                &self.bus,
                self.config.watchdog.clone(),
                self.metrics.clone(),
            ))
        } else {
            Box::new(IntervalWatchdog::new(
                node,
                reconciler,
                self.provided.clone(),
                self.config.watchdog.flush_interval,
                self.metrics.clone(),
            ))
        }
    }

    /// Run `session` until it dies, a task fails, `disconnect` yields an
    /// event or the endpoint shuts down.
    ///
    /// Every task of the session has stopped, and the peer's snapshot is
    /// cleared, by the time this returns.
    pub async fn drive(&self, session: Session, node: Node, roles: Roles, mut disconnect: Listener) -> Result<()> {
        let cancel = session.cancellation();
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        if roles.serve {
            let mut watchdog = self.watchdog(node.clone());
            let watchdog_cancel = cancel.clone();
            tasks.spawn(async move {
                watchdog.run(watchdog_cancel).await;
                Ok(())
            });

            let server = self.server.clone();
            let stream = session.server_stream();
            let (node, cancel) = (node.clone(), cancel.clone());
            tasks.spawn(async move { Ok(server.serve(stream, node, cancel).await?) });
        }

        if let Some(consumer) = roles.consume {
            let client = DeltaSyncClient::new(consumer.node, self.consumed.iter().cloned(), consumer.syncer)
                .with_response_backoff(self.config.response_backoff);
            let stream = session.client_stream();
            let cancel = cancel.clone();
            tasks.spawn(async move { Ok(client.run(stream, cancel).await?) });
        }

        let outcome = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                event = disconnect.recv() => match event {
                    Some(event) => {
                        tracing::info!(peer = %node.id, kind = event.kind(), "closing stream");
                        break Ok(());
                    }
                    None => disconnect = Listener::never(),
                },
                err = session.closed() => {
                    break if err.is_graceful() { Ok(()) } else { Err(err.into()) };
                }
                joined = tasks.join_next(), if !tasks.is_empty() => match joined {
                    None | Some(Ok(Ok(()))) => break Ok(()),
                    Some(Ok(Err(e))) if e.is_unimplemented() => {
                        tracing::info!(peer = %node.id, "peer does not implement part of the stream: {}", e);
                    }
                    Some(Ok(Err(e))) if e.is_graceful() => break Ok(()),
                    Some(Ok(Err(e))) => break Err(e),
                    Some(Err(e)) => break Err(MeshSyncError::Task(e.to_string())),
                },
            }
        };

        session.close();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Err(e)) if !e.is_graceful() => {
                    tracing::debug!(peer = %node.id, "task ended after stream close: {}", e);
                }
                Err(e) => tracing::warn!(peer = %node.id, "task failed: {}", e),
                _ => {}
            }
        }
        disconnect.close();

        match &outcome {
            Ok(()) => tracing::info!(peer = %node.id, "stream closed"),
            Err(e) => tracing::warn!(peer = %node.id, "stream failed: {}", e),
        }
        outcome
    }
}
