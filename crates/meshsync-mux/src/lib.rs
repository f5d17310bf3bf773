//! # meshsync Mux
//!
//! Multiplexed sync sessions between a global control plane and its zones.
//!
//! ## Overview
//!
//! A single physical stream per peer carries both sync directions. A
//! [`Session`] splits it into a [`ServerStream`] role, where this process
//! answers delta discovery requests, and a [`ClientStream`] role, where it
//! issues them. Both roles share one send task so wire order equals
//! enqueue order.
//!
//! ## Key Types
//!
//! - [`MuxMessage`] - The envelope: legacy or delta, request or response
//! - [`MultiplexStream`] - Physical stream abstraction
//! - [`Session`] - Two logical roles over one stream
//! - [`StreamMetadata`] - Client id, protocol version, tenant, features
//!
//! ## Transports
//!
//! - [`transport::memory`] - In-process pipe for tests
//! - [`transport::framed`] - Length-prefixed CBOR over any async byte stream

pub mod error;
pub mod messages;
pub mod metadata;
pub mod session;
pub mod transport;

pub use error::{MuxError, Result};
pub use messages::{
    limits, DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    ErrorDetail, MuxMessage, NodeInfo, WireResource,
};
pub use metadata::{
    StreamMetadata, CLIENT_ID_KEY, FEATURES_KEY, KDS_VERSION_KEY, KDS_VERSION_V2, KDS_VERSION_V3,
    TENANT_KEY,
};
pub use session::{ClientStream, ServerStream, Session, SessionConfig};
pub use transport::{framed::FramedStream, memory::pipe, memory::MemoryStream, MultiplexStream};
