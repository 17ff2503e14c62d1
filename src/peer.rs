//! Peer seam module
//!
//! The engine never owns sockets; it talks to peers through the
//! [`PeerLink`] trait supplied by the transport layer.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::protocol::TransferMessage;

/// Opaque peer identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a peer id from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a peer is reached over the local network or the internet.
/// Decides which shared bandwidth limiter a transfer leg binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerLocality {
    Lan,
    Wan,
}

/// Handle to one connected peer, provided by the transport layer.
///
/// All methods must be safe to call from any task. `send` queues the
/// message for asynchronous delivery; delivery failure surfaces as an
/// error and usually means the connection is gone.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Stable identity of the remote peer
    fn peer_id(&self) -> &PeerId;

    /// Network locality of the peer
    fn locality(&self) -> PeerLocality;

    /// True while the underlying connection is usable
    fn is_connected(&self) -> bool;

    /// True if the peer speaks the multi-source range-request protocol
    fn supports_part_requests(&self) -> bool;

    /// True if the peer can serve block-digest records for delta-sync
    fn supports_delta_sync(&self) -> bool;

    /// Queue a message for delivery to the peer
    async fn send(&self, message: TransferMessage) -> Result<()>;
}
