//! Multiplexed session: two logical sync exchanges over one physical stream.
//!
//! ## Overview
//!
//! Every peer connection carries both sync directions at once. On one side
//! this process acts as the discovery *server* (it receives delta requests
//! and sends delta responses); on the other it acts as the discovery
//! *client* (it sends requests and receives responses).
//!
//! ```text
//!                    ┌──────────── Session ─────────────┐
//!  ServerStream ──▶  │ send queue ──▶ send task ──────▶ │  physical
//!  ClientStream ──▶  │            (one, FIFO)           │  stream
//!                    │                                  │
//!  ServerStream ◀──  │ request q  ◀── receive task ◀─── │
//!  ClientStream ◀──  │ response q ◀──  (one)            │
//!                    └──────────────────────────────────┘
//! ```
//!
//! ## Termination
//!
//! Any receive error (including a clean end of stream), a stuck send or a
//! stuck hand-off kills the whole session. The first error is recorded and
//! every later one is discarded. Once dead, role `send` calls and drained
//! role `recv` calls return that first error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{MuxError, Result};
use crate::messages::{DeltaDiscoveryRequest, DeltaDiscoveryResponse, MuxMessage};
use crate::metadata::StreamMetadata;
use crate::transport::MultiplexStream;

/// Session sizing and timeouts.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Depth of each hand-off queue.
    ///
    /// Must be at least the number of responses that can be in flight at
    /// once, which is the number of synced resource types.
    pub buffer_size: usize,
    /// Upper bound on one physical send, and on handing one received
    /// message to its role.
    pub send_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            send_timeout: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(MuxError::InvalidArgument("session buffer size must be positive".into()));
        }
        if self.send_timeout.is_zero() {
            return Err(MuxError::InvalidArgument("session send timeout must be positive".into()));
        }
        Ok(())
    }
}

/// State shared by the tasks and role handles of one session.
struct Shared {
    peer_id: String,
    error_tx: watch::Sender<Option<MuxError>>,
    cancel: CancellationToken,
}

impl Shared {
    /// Record `err` unless an error is already recorded, then stop the
    /// session.
    fn fail(&self, err: MuxError) {
        let recorded = self.error_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(err.clone());
                true
            } else {
                false
            }
        });
        if recorded {
            if err.is_graceful() {
                tracing::debug!(peer = %self.peer_id, "session ended: {}", err);
            } else {
                tracing::warn!(peer = %self.peer_id, "session failed: {}", err);
            }
        }
        self.cancel.cancel();
    }

    fn error(&self) -> Option<MuxError> {
        self.error_tx.borrow().clone()
    }

    /// The error reported once the session is dead.
    fn terminal_error(&self) -> MuxError {
        self.error().unwrap_or(MuxError::Eof)
    }

    async fn enqueue(&self, tx: &mpsc::Sender<MuxMessage>, message: MuxMessage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.terminal_error());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(self.terminal_error()),
            res = tx.send(message) => res.map_err(|_| self.terminal_error()),
        }
    }
}

/// The role in which this process serves discovery responses.
#[derive(Clone)]
pub struct ServerStream {
    shared: Arc<Shared>,
    send_tx: mpsc::Sender<MuxMessage>,
    requests: Arc<Mutex<mpsc::Receiver<DeltaDiscoveryRequest>>>,
}

impl ServerStream {
    /// Queue a response for the peer.
    pub async fn send(&self, response: DeltaDiscoveryResponse) -> Result<()> {
        self.shared
            .enqueue(&self.send_tx, MuxMessage::DeltaResponse(response))
            .await
    }

    /// Wait for the next request from the peer.
    pub async fn recv(&self) -> Result<DeltaDiscoveryRequest> {
        let mut rx = self.requests.lock().await;
        rx.recv().await.ok_or_else(|| self.shared.terminal_error())
    }

    pub fn peer_id(&self) -> &str {
        &self.shared.peer_id
    }
}

/// The role in which this process consumes discovery responses.
#[derive(Clone)]
pub struct ClientStream {
    shared: Arc<Shared>,
    send_tx: mpsc::Sender<MuxMessage>,
    responses: Arc<Mutex<mpsc::Receiver<DeltaDiscoveryResponse>>>,
}

impl ClientStream {
    /// Queue a request for the peer.
    pub async fn send(&self, request: DeltaDiscoveryRequest) -> Result<()> {
        self.shared
            .enqueue(&self.send_tx, MuxMessage::DeltaRequest(request))
            .await
    }

    /// Wait for the next response from the peer.
    pub async fn recv(&self) -> Result<DeltaDiscoveryResponse> {
        let mut rx = self.responses.lock().await;
        rx.recv().await.ok_or_else(|| self.shared.terminal_error())
    }

    pub fn peer_id(&self) -> &str {
        &self.shared.peer_id
    }
}

/// One physical connection split into a server role and a client role.
///
/// Dropping the session stops both of its tasks.
pub struct Session {
    shared: Arc<Shared>,
    metadata: StreamMetadata,
    server: ServerStream,
    client: ClientStream,
    error_rx: watch::Receiver<Option<MuxError>>,
    _stop: DropGuard,
}

impl Session {
    /// Start a session over `stream`.
    ///
    /// Spawns exactly one receive task and one send task on the current
    /// tokio runtime.
    pub fn new(
        peer_id: impl Into<String>,
        stream: Arc<dyn MultiplexStream>,
        config: SessionConfig,
    ) -> Self {
        let buffer_size = config.buffer_size.max(1);
        let (error_tx, error_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared {
            peer_id: peer_id.into(),
            error_tx,
            cancel: cancel.clone(),
        });

        let (send_tx, send_rx) = mpsc::channel(buffer_size);
        let (request_tx, request_rx) = mpsc::channel(buffer_size);
        let (response_tx, response_rx) = mpsc::channel(buffer_size);

        tokio::spawn(receive_loop(
            Arc::clone(&shared),
            Arc::clone(&stream),
            request_tx,
            response_tx,
            config.send_timeout,
        ));
        tokio::spawn(send_loop(
            Arc::clone(&shared),
            Arc::clone(&stream),
            send_rx,
            config.send_timeout,
        ));

        tracing::debug!(peer = %shared.peer_id, buffer_size, "session started");

        Self {
            metadata: stream.metadata().clone(),
            server: ServerStream {
                shared: Arc::clone(&shared),
                send_tx: send_tx.clone(),
                requests: Arc::new(Mutex::new(request_rx)),
            },
            client: ClientStream {
                shared: Arc::clone(&shared),
                send_tx,
                responses: Arc::new(Mutex::new(response_rx)),
            },
            shared,
            error_rx,
            _stop: cancel.drop_guard(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.shared.peer_id
    }

    /// Metadata of the underlying stream.
    pub fn metadata(&self) -> &StreamMetadata {
        &self.metadata
    }

    /// Handle for the server role.
    pub fn server_stream(&self) -> ServerStream {
        self.server.clone()
    }

    /// Handle for the client role.
    pub fn client_stream(&self) -> ClientStream {
        self.client.clone()
    }

    /// The first error recorded, if the session is dead.
    pub fn error(&self) -> Option<MuxError> {
        self.shared.error()
    }

    /// Wait until the session dies and return its first error.
    pub async fn closed(&self) -> MuxError {
        let mut rx = self.error_rx.clone();
        loop {
            if let Some(err) = rx.borrow_and_update().clone() {
                return err;
            }
            if rx.changed().await.is_err() {
                return self.shared.terminal_error();
            }
        }
    }

    /// Stop the session locally. Records `Cancelled` unless it already died.
    pub fn close(&self) {
        self.shared.fail(MuxError::Cancelled);
    }

    /// Token cancelled when the session dies.
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.child_token()
    }
}

/// Drain the physical stream into the role queues.
async fn receive_loop(
    shared: Arc<Shared>,
    stream: Arc<dyn MultiplexStream>,
    request_tx: mpsc::Sender<DeltaDiscoveryRequest>,
    response_tx: mpsc::Sender<DeltaDiscoveryResponse>,
    timeout: Duration,
) {
    loop {
        let received = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            res = stream.recv() => res,
        };

        let delivered = match received {
            Ok(MuxMessage::DeltaRequest(req)) => deliver(&shared, &request_tx, req, timeout).await,
            Ok(MuxMessage::DeltaResponse(resp)) => deliver(&shared, &response_tx, resp, timeout).await,
            Ok(legacy) => Err(MuxError::Protocol(format!(
                "{} is not accepted on a delta session",
                legacy.variant_name()
            ))),
            Err(e) => Err(e),
        };

        if let Err(e) = delivered {
            shared.fail(e);
            break;
        }
    }
    // Dropping the senders closes both role queues once drained.
}

/// Hand one message to a role queue, waiting at most `timeout`.
async fn deliver<T>(
    shared: &Shared,
    tx: &mpsc::Sender<T>,
    message: T,
    timeout: Duration,
) -> Result<()> {
    tokio::select! {
        _ = shared.cancel.cancelled() => Err(shared.terminal_error()),
        res = tokio::time::timeout(timeout, tx.send(message)) => match res {
            Ok(Ok(())) => Ok(()),
            // The role handle is gone: nobody will ever read this queue.
            Ok(Err(_)) => Err(MuxError::Cancelled),
            Err(_) => Err(MuxError::RecvStuck {
                peer: shared.peer_id.clone(),
                timeout,
            }),
        },
    }
}

/// Drain the shared send queue into the physical stream.
async fn send_loop(
    shared: Arc<Shared>,
    stream: Arc<dyn MultiplexStream>,
    mut send_rx: mpsc::Receiver<MuxMessage>,
    timeout: Duration,
) {
    loop {
        let message = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            msg = send_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let sent = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            res = tokio::time::timeout(timeout, stream.send(message)) => res,
        };

        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                shared.fail(e);
                break;
            }
            Err(_) => {
                tracing::error!(peer = %shared.peer_id, ?timeout, "send stuck");
                shared.fail(MuxError::SendStuck {
                    peer: shared.peer_id.clone(),
                    timeout,
                });
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DiscoveryRequest;
    use crate::metadata::{CLIENT_ID_KEY, KDS_VERSION_KEY, KDS_VERSION_V3};
    use crate::transport::memory::{pipe, MemoryStream};

    fn metadata(client_id: &str) -> StreamMetadata {
        StreamMetadata::new()
            .with(CLIENT_ID_KEY, client_id)
            .with(KDS_VERSION_KEY, KDS_VERSION_V3)
    }

    fn request(version: &str) -> DeltaDiscoveryRequest {
        DeltaDiscoveryRequest {
            response_nonce: version.into(),
            ..Default::default()
        }
    }

    fn response(nonce: &str) -> DeltaDiscoveryResponse {
        DeltaDiscoveryResponse {
            nonce: nonce.into(),
            ..Default::default()
        }
    }

    fn config(buffer_size: usize, send_timeout: Duration) -> SessionConfig {
        SessionConfig {
            buffer_size,
            send_timeout,
        }
    }

    /// A session on one end of a pipe; the raw other end is returned.
    fn session_with_raw_peer(cfg: SessionConfig) -> (Session, MemoryStream, CancellationToken) {
        let (local, remote) = pipe(metadata("zone-1"), metadata("global"), 1);
        let cancel = local.cancel_token();
        (Session::new("zone-1", Arc::new(local), cfg), remote, cancel)
    }

    #[tokio::test]
    async fn test_roles_cross_between_sessions() {
        let (a, b) = pipe(metadata("zone-1"), metadata("global"), 1);
        let global = Session::new("zone-1", Arc::new(a), SessionConfig::default());
        let zone = Session::new("global", Arc::new(b), SessionConfig::default());

        zone.client_stream().send(request("1")).await.unwrap();
        assert_eq!(global.server_stream().recv().await.unwrap(), request("1"));

        global.server_stream().send(response("2")).await.unwrap();
        assert_eq!(zone.client_stream().recv().await.unwrap(), response("2"));

        global.client_stream().send(request("3")).await.unwrap();
        assert_eq!(zone.server_stream().recv().await.unwrap(), request("3"));

        zone.server_stream().send(response("4")).await.unwrap();
        assert_eq!(global.client_stream().recv().await.unwrap(), response("4"));
    }

    #[tokio::test]
    async fn test_send_order_is_preserved() {
        let (session, remote, _cancel) = session_with_raw_peer(SessionConfig::default());
        let server = session.server_stream();

        server.send(response("A")).await.unwrap();
        server.send(response("B")).await.unwrap();

        assert_eq!(remote.recv().await.unwrap(), MuxMessage::DeltaResponse(response("A")));
        assert_eq!(remote.recv().await.unwrap(), MuxMessage::DeltaResponse(response("B")));
    }

    #[tokio::test]
    async fn test_eof_terminates_both_roles() {
        let (session, remote, cancel) = session_with_raw_peer(SessionConfig::default());

        remote.send(request("r").into()).await.unwrap();
        assert_eq!(session.server_stream().recv().await.unwrap(), request("r"));

        cancel.cancel();
        assert_eq!(session.closed().await, MuxError::Eof);
        assert_eq!(session.error(), Some(MuxError::Eof));

        assert_eq!(session.server_stream().send(response("x")).await, Err(MuxError::Eof));
        assert_eq!(session.client_stream().send(request("x")).await, Err(MuxError::Eof));
        assert_eq!(session.server_stream().recv().await, Err(MuxError::Eof));
        assert_eq!(session.client_stream().recv().await, Err(MuxError::Eof));
    }

    #[tokio::test]
    async fn test_legacy_message_is_protocol_error() {
        let (session, remote, _cancel) = session_with_raw_peer(SessionConfig::default());
        remote
            .send(MuxMessage::LegacyRequest(DiscoveryRequest::default()))
            .await
            .unwrap();
        assert!(matches!(session.closed().await, MuxError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let (session, _remote, cancel) = session_with_raw_peer(SessionConfig::default());
        session.close();
        cancel.cancel();
        assert_eq!(session.closed().await, MuxError::Cancelled);
        tokio::task::yield_now().await;
        assert_eq!(session.error(), Some(MuxError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_stuck_terminates_session() {
        // The raw peer never reads; the pipe holds one message.
        let (session, _remote, _cancel) =
            session_with_raw_peer(config(10, Duration::from_secs(5)));
        let server = session.server_stream();

        server.send(response("1")).await.unwrap();
        server.send(response("2")).await.unwrap();

        let err = session.closed().await;
        assert!(matches!(err, MuxError::SendStuck { .. }));
        assert!(matches!(
            session.client_stream().send(request("late")).await,
            Err(MuxError::SendStuck { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_one_queue_back_pressure() {
        let (session, remote, _cancel) =
            session_with_raw_peer(config(1, Duration::from_secs(30)));
        let client = session.client_stream();

        remote.send(response("first").into()).await.unwrap();
        remote.send(response("second").into()).await.unwrap();

        // The second response waits for the first to be drained.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(session.error(), None);

        assert_eq!(client.recv().await.unwrap(), response("first"));
        assert_eq!(client.recv().await.unwrap(), response("second"));
        assert_eq!(session.error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undrained_role_queue_is_recv_stuck() {
        let (session, remote, _cancel) =
            session_with_raw_peer(config(1, Duration::from_secs(5)));

        remote.send(response("first").into()).await.unwrap();
        remote.send(response("second").into()).await.unwrap();

        assert!(matches!(session.closed().await, MuxError::RecvStuck { .. }));
        // Queued messages are still delivered before the error.
        assert_eq!(session.client_stream().recv().await.unwrap(), response("first"));
        assert!(matches!(
            session.client_stream().recv().await,
            Err(MuxError::RecvStuck { .. })
        ));
    }

    #[tokio::test]
    async fn test_drop_stops_tasks() {
        let (local, remote) = pipe(metadata("zone-1"), metadata("global"), 1);
        let session = Session::new("zone-1", Arc::new(local), SessionConfig::default());
        let token = session.cancellation();
        drop(session);
        token.cancelled().await;
        drop(remote);
    }

    #[test]
    fn test_config_validate() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(config(0, Duration::from_secs(1)).validate().is_err());
        assert!(config(1, Duration::ZERO).validate().is_err());
    }
}
