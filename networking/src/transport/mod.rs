//! Bidirectional ordered byte channels to one peer.
//!
//! Two concrete variants behind one tagged pair of halves: a direct TCP
//! channel and a relayed channel multiplexed over the node's relay
//! connection. Frames are newline-delimited UTF-8 JSON. The write half is
//! cheap to clone and lives in the peer table; the read half is consumed by
//! that peer's reader task.

pub mod direct;
pub mod relay;

pub use direct::{DirectListener, DirectReceiver, DirectSender};
pub use relay::{RelayClient, RelayEnvelope, RelayReceiver, RelaySender, RelayServer};

use crate::error::NetworkResult;
use crate::types::TransportKind;

/// Write half of a peer channel.
#[derive(Clone)]
pub enum TransportSender {
    Direct(DirectSender),
    Relay(RelaySender),
}

impl TransportSender {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportSender::Direct(_) => TransportKind::Direct,
            TransportSender::Relay(_) => TransportKind::Relay,
        }
    }

    /// Deliver one frame. `Err` means the channel is no longer usable.
    pub async fn send(&self, frame: &str) -> NetworkResult<()> {
        match self {
            TransportSender::Direct(sender) => sender.send(frame).await,
            TransportSender::Relay(sender) => sender.send(frame).await,
        }
    }

    /// Best-effort teardown; safe to call more than once.
    pub async fn close(&self) {
        match self {
            TransportSender::Direct(sender) => sender.close().await,
            TransportSender::Relay(sender) => sender.close(),
        }
    }
}

/// Read half of a peer channel, owned by the peer's reader task.
pub enum TransportReceiver {
    Direct(DirectReceiver),
    Relay(RelayReceiver),
}

impl TransportReceiver {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportReceiver::Direct(_) => TransportKind::Direct,
            TransportReceiver::Relay(_) => TransportKind::Relay,
        }
    }

    /// Next frame, or `None` once the channel has closed.
    pub async fn next_frame(&mut self) -> Option<String> {
        match self {
            TransportReceiver::Direct(receiver) => receiver.next_frame().await,
            TransportReceiver::Relay(receiver) => receiver.next_frame().await,
        }
    }
}
