//! Shared types: peer lifecycle states, contact records, and the typed
//! event stream the connection manager feeds the orchestrator.

use std::net::SocketAddr;

use protocol::{Message, MessageKind, NodeId, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Per-peer connection state machine.
///
/// ```text
/// Disconnected -> Connecting -> Connected | Relaying
///                      |             |         |
///                      +---------> Error <-----+
/// ```
///
/// `Connected` and `Relaying` are the only states in which messages may be
/// sent or received. `Error` is terminal; the peer record is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
    Relaying,
    Error,
}

impl PeerState {
    /// Check if a transition to the target state is valid.
    pub fn can_transition_to(&self, target: PeerState) -> bool {
        match self {
            PeerState::Disconnected => matches!(target, PeerState::Connecting),
            PeerState::Connecting => matches!(
                target,
                PeerState::Connected | PeerState::Relaying | PeerState::Error
            ),
            PeerState::Connected | PeerState::Relaying => matches!(target, PeerState::Error),
            PeerState::Error => false,
        }
    }

    /// True in the states that may carry messages.
    pub fn is_sending(&self) -> bool {
        matches!(self, PeerState::Connected | PeerState::Relaying)
    }
}

/// Which concrete transport a peer is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Direct,
    Relay,
}

/// How a peer is introduced to the manager. The core never discovers peers
/// on its own; it is told about them.
#[derive(Debug, Clone)]
pub struct PeerContact {
    pub node_id: NodeId,
    pub public_key: PublicKey,
    /// Reachable socket address for the direct transport; `None` sends the
    /// connection straight to the relay fallback.
    pub address: Option<SocketAddr>,
}

/// Link quality as measured by the manager.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PeerQuality {
    pub latency_ms: f64,
    /// Relative to the best-known peer; reserved, currently always 1.0.
    pub relative_bandwidth: f64,
    /// Exponentially weighted send success ratio.
    pub reliability: f64,
}

impl Default for PeerQuality {
    fn default() -> Self {
        PeerQuality {
            latency_ms: 0.0,
            relative_bandwidth: 1.0,
            reliability: 1.0,
        }
    }
}

/// Read-only snapshot of one peer table row.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub state: PeerState,
    pub transport: TransportKind,
    pub public_key: PublicKey,
    pub last_seen: u64,
    pub last_ping: u64,
    pub latency_ms: Option<u64>,
    pub quality: PeerQuality,
    pub supported_kinds: Vec<MessageKind>,
}

/// Typed event stream from the connection manager, delivered synchronously
/// with respect to the triggering transport event.
#[derive(Debug)]
pub enum PeerEvent {
    Connected(PeerInfo),
    Disconnected { peer_id: NodeId, reason: String },
    Message { message: Message, from: NodeId },
    Error { error: NetworkError, peer_id: Option<NodeId> },
}

/// Plaintext of a `Hello` handshake payload (base64 JSON on the wire; it
/// carries the key material needed before any shared secret exists).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub public_key: PublicKey,
    #[serde(default)]
    pub supported_kinds: Vec<MessageKind>,
}
