//! Networking for the murmur overlay: transports, the connection manager,
//! and the gossip/resonance orchestrator.
//!
//! The layering mirrors the message flow: [`transport`] moves frames,
//! [`peers`] owns per-peer state and the encryption envelope, [`node`]
//! deduplicates, propagates and dispatches to [`extensions`].

pub mod config;
pub mod envelope;
pub mod error;
pub mod extensions;
pub mod gossip;
pub mod matcher;
pub mod node;
pub mod peers;
pub mod transport;
pub mod types;

pub use config::{ConnectionConfig, GossipConfig, NetworkConfig};
pub use error::{NetworkError, NetworkResult};
pub use extensions::{Extension, ExtensionRegistry};
pub use matcher::{ResonanceMatcher, StrengthThreshold};
pub use node::{Node, NodeBuilder, NodeHandle, NodeStats, ObservedMessage};
pub use peers::PeerManager;
pub use transport::relay::RelayServer;
pub use types::{PeerContact, PeerEvent, PeerInfo, PeerQuality, PeerState, TransportKind};
