//! The on-wire message record.
//!
//! A record is a shared header plus a kind-tagged body; the `kind` field is
//! the serde tag, so an unknown kind fails at deserialization and surfaces
//! as a validation error in the receive pipeline. Records are immutable
//! after construction except for the broadcast forwarding mutation
//! ([`Message::mark_forwarded_by`]).

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::node_id::NodeId;
use crate::tags::{ResonanceKey, WhisperTag, derive_resonance_key, generate_whisper_tag};
use crate::{DEFAULT_TTL_MS, PING_TTL_MS, PROTOCOL_VERSION};

/// Bytes in the dedup/replay nonce (rendered as 32 hex digits).
pub const NONCE_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Whisper,
    Broadcast,
    Resonance,
    Ping,
    Pong,
    Hello,
    Goodbye,
    Error,
    FileSync,
    MiningSignal,
    Dreamspace,
}

impl MessageKind {
    pub const ALL: [MessageKind; 11] = [
        MessageKind::Whisper,
        MessageKind::Broadcast,
        MessageKind::Resonance,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Hello,
        MessageKind::Goodbye,
        MessageKind::Error,
        MessageKind::FileSync,
        MessageKind::MiningSignal,
        MessageKind::Dreamspace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Whisper => "whisper",
            MessageKind::Broadcast => "broadcast",
            MessageKind::Resonance => "resonance",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Hello => "hello",
            MessageKind::Goodbye => "goodbye",
            MessageKind::Error => "error",
            MessageKind::FileSync => "file_sync",
            MessageKind::MiningSignal => "mining_signal",
            MessageKind::Dreamspace => "dreamspace",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific arms of the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    /// Point-to-point delivery to a single recipient.
    Whisper { target_id: NodeId },
    /// Epidemic propagation with hop and TTL caps.
    Broadcast {
        max_hops: u32,
        current_hops: u32,
        seen_by: Vec<NodeId>,
    },
    /// Interest advertisement, matched by the receiver's resonance policy.
    Resonance { intent: String, strength: f64 },
    Ping,
    Pong,
    /// Connection handshake; its payload is unencrypted base64 JSON since no
    /// shared secret exists yet.
    Hello,
    Goodbye {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Error {
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        data: serde_json::Value,
    },
    FileSync {
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        data: serde_json::Value,
    },
    MiningSignal {
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        data: serde_json::Value,
    },
    Dreamspace {
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        data: serde_json::Value,
    },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Whisper { .. } => MessageKind::Whisper,
            MessageBody::Broadcast { .. } => MessageKind::Broadcast,
            MessageBody::Resonance { .. } => MessageKind::Resonance,
            MessageBody::Ping => MessageKind::Ping,
            MessageBody::Pong => MessageKind::Pong,
            MessageBody::Hello => MessageKind::Hello,
            MessageBody::Goodbye { .. } => MessageKind::Goodbye,
            MessageBody::Error { .. } => MessageKind::Error,
            MessageBody::FileSync { .. } => MessageKind::FileSync,
            MessageBody::MiningSignal { .. } => MessageKind::MiningSignal,
            MessageBody::Dreamspace { .. } => MessageKind::Dreamspace,
        }
    }
}

/// Optional construction knobs shared by all kinds.
#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    /// Semantic topic; drives the resonance key (and the whisper tag when
    /// none is given). Defaults to `"default"`.
    pub intent: Option<String>,
    pub ttl_ms: Option<u64>,
    pub whisper_tag: Option<WhisperTag>,
}

impl MessageOptions {
    pub fn with_intent(intent: impl Into<String>) -> Self {
        MessageOptions {
            intent: Some(intent.into()),
            ..Default::default()
        }
    }
}

/// One overlay message: shared header plus kind-specific body.
///
/// The `payload` field is the base64 encryption envelope on the wire; the
/// connection manager replaces it with the decrypted plaintext before the
/// record reaches the orchestrator and extensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: NodeId,
    pub resonance_key: ResonanceKey,
    pub whisper_tag: WhisperTag,
    pub payload: String,
    pub timestamp: u64,
    pub version: String,
    pub ttl: u64,
    /// 128-bit random value, 32 hex digits; dedup key together with `sender`.
    pub nonce: String,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    /// Populate the common header and attach the given body.
    pub fn construct(
        body: MessageBody,
        sender: NodeId,
        payload: impl Into<String>,
        options: MessageOptions,
    ) -> Result<Self, ProtocolError> {
        Self::construct_at(body, sender, payload, options, crate::now_ms())
    }

    /// [`Message::construct`] with an explicit wall clock, for tests and replays.
    pub fn construct_at(
        body: MessageBody,
        sender: NodeId,
        payload: impl Into<String>,
        options: MessageOptions,
        now_ms: u64,
    ) -> Result<Self, ProtocolError> {
        let intent = options.intent.as_deref().unwrap_or("default");
        Ok(Message {
            resonance_key: derive_resonance_key(intent),
            whisper_tag: options
                .whisper_tag
                .unwrap_or_else(|| generate_whisper_tag(intent, None)),
            payload: payload.into(),
            timestamp: now_ms,
            version: PROTOCOL_VERSION.to_owned(),
            ttl: options.ttl_ms.unwrap_or(DEFAULT_TTL_MS),
            nonce: generate_nonce()?,
            sender,
            body,
        })
    }

    pub fn whisper(
        sender: NodeId,
        target_id: NodeId,
        payload: impl Into<String>,
        options: MessageOptions,
    ) -> Result<Self, ProtocolError> {
        Self::construct(MessageBody::Whisper { target_id }, sender, payload, options)
    }

    /// A fresh broadcast starts at hop zero with only the sender in `seen_by`.
    pub fn broadcast(
        sender: NodeId,
        payload: impl Into<String>,
        max_hops: u32,
        options: MessageOptions,
    ) -> Result<Self, ProtocolError> {
        let body = MessageBody::Broadcast {
            max_hops,
            current_hops: 0,
            seen_by: vec![sender.clone()],
        };
        Self::construct(body, sender, payload, options)
    }

    /// The intent names both the advertisement topic and the resonance key.
    pub fn resonance(
        sender: NodeId,
        intent: impl Into<String>,
        strength: f64,
        mut options: MessageOptions,
    ) -> Result<Self, ProtocolError> {
        let intent = intent.into();
        options.intent = Some(intent.clone());
        Self::construct(MessageBody::Resonance { intent, strength }, sender, "", options)
    }

    /// Heartbeat probe: empty payload, short TTL.
    pub fn ping(sender: NodeId) -> Result<Self, ProtocolError> {
        let options = MessageOptions {
            ttl_ms: Some(PING_TTL_MS),
            ..Default::default()
        };
        Self::construct(MessageBody::Ping, sender, "", options)
    }

    /// Heartbeat reply; the payload echoes the ping's timestamp so the
    /// sender can measure the round trip.
    pub fn pong(sender: NodeId, echoed_timestamp_ms: u64) -> Result<Self, ProtocolError> {
        let options = MessageOptions {
            ttl_ms: Some(PING_TTL_MS),
            ..Default::default()
        };
        Self::construct(
            MessageBody::Pong,
            sender,
            echoed_timestamp_ms.to_string(),
            options,
        )
    }

    pub fn hello(sender: NodeId, payload: impl Into<String>) -> Result<Self, ProtocolError> {
        Self::construct(MessageBody::Hello, sender, payload, MessageOptions::default())
    }

    pub fn goodbye(sender: NodeId, reason: Option<String>) -> Result<Self, ProtocolError> {
        Self::construct(
            MessageBody::Goodbye { reason },
            sender,
            "",
            MessageOptions::default(),
        )
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Replay/dedup key: `(sender, nonce)`.
    pub fn dedup_key(&self) -> (NodeId, String) {
        (self.sender.clone(), self.nonce.clone())
    }

    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn deserialize(wire: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(wire)
    }

    /// Record the local node as a forwarding hop.
    ///
    /// Returns `false` (and leaves the record untouched) when the hop cap is
    /// reached or the node already appears in `seen_by`, i.e. when the
    /// broadcast must not travel further through this node.
    pub fn mark_forwarded_by(&mut self, node: &NodeId) -> bool {
        match &mut self.body {
            MessageBody::Broadcast {
                max_hops,
                current_hops,
                seen_by,
            } => {
                if *current_hops >= *max_hops || seen_by.contains(node) {
                    return false;
                }
                seen_by.push(node.clone());
                *current_hops += 1;
                true
            }
            _ => false,
        }
    }
}

/// Fresh 128-bit random nonce as 32 lowercase hex digits.
pub fn generate_nonce() -> Result<String, ProtocolError> {
    let mut bytes = [0u8; NONCE_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| ProtocolError::Rng(err.to_string()))?;
    Ok(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::validate::Validation;

    fn sender() -> NodeId {
        NodeId::generate_at(1_000).unwrap()
    }

    #[test]
    fn construct_fills_header_defaults() {
        let msg = Message::construct_at(
            MessageBody::Ping,
            sender(),
            "",
            MessageOptions::default(),
            42,
        )
        .unwrap();

        assert_eq!(msg.timestamp, 42);
        assert_eq!(msg.version, PROTOCOL_VERSION);
        assert_eq!(msg.ttl, DEFAULT_TTL_MS);
        assert_eq!(msg.nonce.len(), 2 * NONCE_BYTES);
        assert_eq!(msg.resonance_key, derive_resonance_key("default"));
        assert_eq!(msg.whisper_tag, generate_whisper_tag("default", None));
    }

    #[test]
    fn broadcast_starts_with_sender_seen() {
        let from = sender();
        let msg =
            Message::broadcast(from.clone(), "hi", 10, MessageOptions::default()).unwrap();

        match &msg.body {
            MessageBody::Broadcast {
                max_hops,
                current_hops,
                seen_by,
            } => {
                assert_eq!(*max_hops, 10);
                assert_eq!(*current_hops, 0);
                assert_eq!(seen_by, &vec![from]);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn serde_round_trip_stays_valid() {
        let target = NodeId::generate_at(2_000).unwrap();
        let msg = Message::whisper(
            sender(),
            target,
            "secret",
            MessageOptions::with_intent("file:sync"),
        )
        .unwrap();

        let wire = msg.serialize().unwrap();
        let back = Message::deserialize(&wire).unwrap();
        assert_eq!(back, msg);

        let Validation { valid, errors, .. } = back.validate_at(msg.timestamp);
        assert!(valid, "errors: {errors:?}");
    }

    #[test]
    fn kind_tag_is_snake_case_on_the_wire() {
        let msg = Message::construct_at(
            MessageBody::MiningSignal {
                data: json!({"difficulty": 9}),
            },
            sender(),
            "",
            MessageOptions::default(),
            5,
        )
        .unwrap();

        let wire = msg.serialize().unwrap();
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["kind"], "mining_signal");
        assert_eq!(value["data"]["difficulty"], 9);
    }

    #[test]
    fn unknown_kind_fails_to_deserialize() {
        let msg = Message::ping(sender()).unwrap();
        let wire = msg.serialize().unwrap().replace("\"ping\"", "\"screech\"");
        assert!(Message::deserialize(&wire).is_err());
    }

    #[test]
    fn resonance_sets_key_from_intent() {
        let msg =
            Message::resonance(sender(), "mining:coord", 0.8, MessageOptions::default())
                .unwrap();
        assert_eq!(msg.resonance_key, derive_resonance_key("mining:coord"));
    }

    #[test]
    fn mark_forwarded_appends_and_increments() {
        let hop = NodeId::generate_at(3_000).unwrap();
        let mut msg =
            Message::broadcast(sender(), "hi", 2, MessageOptions::default()).unwrap();

        assert!(msg.mark_forwarded_by(&hop));
        // Same node never forwards twice.
        assert!(!msg.mark_forwarded_by(&hop));

        match &msg.body {
            MessageBody::Broadcast {
                current_hops,
                seen_by,
                ..
            } => {
                assert_eq!(*current_hops, 1);
                assert_eq!(seen_by.len(), 2);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn mark_forwarded_respects_hop_cap() {
        let mut msg =
            Message::broadcast(sender(), "hi", 0, MessageOptions::default()).unwrap();
        assert!(!msg.mark_forwarded_by(&NodeId::generate_at(9).unwrap()));
    }

    #[test]
    fn nonces_are_unique_hex() {
        let a = generate_nonce().unwrap();
        let b = generate_nonce().unwrap();
        assert_ne!(a, b);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
    }
}
