//! Request/response transport
//!
//! Pairing and sync traffic travels as one [`WireEnvelope`] request and
//! one reply. Pairing bodies are plaintext JSON (the signatures inside
//! carry the trust); sync bodies are AES-GCM ciphertext under the peer
//! session key. The websocket implementation serves real deployments,
//! the loopback one wires two in-process instances together for tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::DeviceId;

pub mod loopback;
pub mod ws;

pub use loopback::LoopbackNetwork;
pub use ws::WsTransport;

/// Hard cap on one wire message, matching the clipboard payload cap plus
/// framing headroom.
pub const MAX_WIRE_MESSAGE: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no route to endpoint {0}")]
    NoRoute(String),

    #[error("message too large: {0} bytes")]
    TooLarge(usize),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireKind {
    PairingRequest,
    PairingResponse,
    /// Encrypted sync traffic; the inner message enum dispatches.
    Sync,
    Ack,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub from: DeviceId,
    pub kind: WireKind,
    pub body: Vec<u8>,
}

impl WireEnvelope {
    pub fn new(from: DeviceId, kind: WireKind, body: Vec<u8>) -> Self {
        Self { from, kind, body }
    }

    pub fn error(from: DeviceId, message: impl Into<String>) -> Self {
        Self {
            from,
            kind: WireKind::Error,
            body: message.into().into_bytes(),
        }
    }
}

/// Client side: send one envelope, get one reply.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, endpoint: &str, envelope: WireEnvelope)
        -> Result<WireEnvelope, NetError>;
}

/// Server side: whatever answers inbound envelopes (the sync manager).
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, envelope: WireEnvelope) -> WireEnvelope;
}
