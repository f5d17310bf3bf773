//! Wire messages for the sync protocol.
//!
//! Discovery requests and responses follow the shape of the Envoy xDS
//! messages. Two flavours exist: the legacy state-of-the-world pair and the
//! incremental (delta) pair. A [`MuxMessage`] wraps either so both logical
//! exchanges of a session share one physical stream.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Node identity carried on requests.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub features: Vec<String>,
}

/// A rejection reason attached to a request (NACK).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: i32,
    pub message: String,
}

impl ErrorDetail {
    /// Generic "internal" code, used for rejections.
    pub const INTERNAL: i32 = 13;

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: Self::INTERNAL,
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Legacy (state of the world)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub version_info: String,
    pub node: Option<NodeInfo>,
    pub resource_names: Vec<String>,
    pub type_url: String,
    pub response_nonce: String,
    pub error_detail: Option<ErrorDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub version_info: String,
    pub resources: Vec<Bytes>,
    pub type_url: String,
    pub nonce: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Delta
// ─────────────────────────────────────────────────────────────────────────────

/// Subscription change, ACK or NACK from the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeltaDiscoveryRequest {
    pub node: Option<NodeInfo>,
    pub type_url: String,
    pub resource_names_subscribe: Vec<String>,
    pub resource_names_unsubscribe: Vec<String>,
    /// Resources the client already holds, sent on the first request of a
    /// type so the server does not resend them.
    pub initial_resource_versions: BTreeMap<String, String>,
    /// Nonce of the response being (N)ACKed. Empty on a fresh subscription.
    pub response_nonce: String,
    /// Set when the response was rejected.
    pub error_detail: Option<ErrorDetail>,
}

impl DeltaDiscoveryRequest {
    pub fn is_nack(&self) -> bool {
        self.error_detail.is_some()
    }

    /// ACK or NACK of a previous response, as opposed to a fresh subscription.
    pub fn is_response_to(&self, nonce: &str) -> bool {
        !self.response_nonce.is_empty() && self.response_nonce == nonce
    }
}

/// One resource in a delta response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireResource {
    pub name: String,
    pub version: String,
    /// Encoded resource body.
    pub resource: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeltaDiscoveryResponse {
    pub system_version_info: String,
    pub resources: Vec<WireResource>,
    pub type_url: String,
    pub removed_resources: Vec<String>,
    pub nonce: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// The multiplexing envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MuxMessage {
    LegacyRequest(DiscoveryRequest),
    LegacyResponse(DiscoveryResponse),
    DeltaRequest(DeltaDiscoveryRequest),
    DeltaResponse(DeltaDiscoveryResponse),
}

impl MuxMessage {
    pub fn variant_name(&self) -> &'static str {
        match self {
            MuxMessage::LegacyRequest(_) => "LegacyRequest",
            MuxMessage::LegacyResponse(_) => "LegacyResponse",
            MuxMessage::DeltaRequest(_) => "DeltaRequest",
            MuxMessage::DeltaResponse(_) => "DeltaResponse",
        }
    }
}

impl From<DeltaDiscoveryRequest> for MuxMessage {
    fn from(req: DeltaDiscoveryRequest) -> Self {
        MuxMessage::DeltaRequest(req)
    }
}

impl From<DeltaDiscoveryResponse> for MuxMessage {
    fn from(resp: DeltaDiscoveryResponse) -> Self {
        MuxMessage::DeltaResponse(resp)
    }
}

/// Protocol limits.
pub mod limits {
    /// Largest encoded frame accepted by the framed transport.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
}
