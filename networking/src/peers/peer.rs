//! One row of the connection manager's peer table.

use std::sync::Arc;

use protocol::{MessageKind, NodeId, PublicKey};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::envelope::Envelope;
use crate::transport::TransportSender;
use crate::types::{PeerInfo, PeerQuality, PeerState};

/// Weight of the newest observation in the reliability average.
const RELIABILITY_WEIGHT: f64 = 0.1;

/// Live state for one known peer. Created on introduction or inbound
/// connection, mutated only by the manager's own handlers, dropped on
/// disconnect, transport failure, eviction or shutdown.
pub struct Peer {
    pub node_id: NodeId,
    pub state: PeerState,
    pub public_key: PublicKey,
    pub sender: TransportSender,
    /// Cached key agreement; bound only to `public_key`.
    pub envelope: Arc<Envelope>,
    pub last_seen: u64,
    pub last_ping: u64,
    pub latency_ms: Option<u64>,
    pub quality: PeerQuality,
    pub supported_kinds: Vec<MessageKind>,
    /// Task draining the peer's read half; `None` only during installation.
    pub reader: Option<JoinHandle<()>>,
}

impl Peer {
    /// A fresh row starts in `Connecting`; the manager drives it into a
    /// sending state through [`Peer::transition`] once the channel is open.
    pub fn new(
        node_id: NodeId,
        public_key: PublicKey,
        sender: TransportSender,
        envelope: Arc<Envelope>,
        supported_kinds: Vec<MessageKind>,
        now_ms: u64,
    ) -> Self {
        Peer {
            node_id,
            state: PeerState::Connecting,
            public_key,
            sender,
            envelope,
            last_seen: now_ms,
            last_ping: 0,
            latency_ms: None,
            quality: PeerQuality::default(),
            supported_kinds,
            reader: None,
        }
    }

    /// Move the state machine, refusing transitions the lifecycle forbids.
    ///
    /// A refusal means a bug in the caller; the state is left untouched so
    /// the caller can drop the row instead of operating on a peer in an
    /// impossible state.
    pub fn transition(&mut self, next: PeerState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                peer = %self.node_id,
                from = ?self.state,
                to = ?next,
                "Refusing invalid peer state transition"
            );
            return false;
        }
        self.state = next;
        true
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            node_id: self.node_id.clone(),
            state: self.state,
            transport: self.sender.kind(),
            public_key: self.public_key,
            last_seen: self.last_seen,
            last_ping: self.last_ping,
            latency_ms: self.latency_ms,
            quality: self.quality,
            supported_kinds: self.supported_kinds.clone(),
        }
    }

    pub fn record_send_success(&mut self) {
        self.quality.reliability += RELIABILITY_WEIGHT * (1.0 - self.quality.reliability);
    }

    pub fn record_send_failure(&mut self) {
        self.quality.reliability *= 1.0 - RELIABILITY_WEIGHT;
    }

    /// Record a measured round trip from a pong echo.
    pub fn record_latency(&mut self, round_trip_ms: u64) {
        self.latency_ms = Some(round_trip_ms);
        self.quality.latency_ms = round_trip_ms as f64;
    }

    pub fn abort_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
