//! Wire-level data model for the murmur overlay.
//!
//! Everything here is pure data and pure computation: ephemeral node
//! identifiers, X25519 key material, intent-derived routing tags, and the
//! message record with its validation rules. Nothing in this crate touches
//! the network or holds shared state.

pub mod error;
pub mod keys;
pub mod message;
pub mod node_id;
pub mod tags;
pub mod validate;

pub use error::ProtocolError;
pub use keys::{KeyPair, PublicKey};
pub use message::{Message, MessageBody, MessageKind, MessageOptions};
pub use node_id::NodeId;
pub use tags::{ResonanceKey, WhisperTag, derive_resonance_key, generate_whisper_tag};
pub use validate::Validation;

use std::time::{SystemTime, UNIX_EPOCH};

/// Semver protocol version carried in every record. A mismatch on receive is
/// a warning, not an error.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Default message time-to-live in milliseconds.
pub const DEFAULT_TTL_MS: u64 = 300_000;

/// TTL for heartbeat pings.
pub const PING_TTL_MS: u64 = 10_000;

/// Current wall clock in Unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as u64
}
