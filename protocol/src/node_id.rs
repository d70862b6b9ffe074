//! Ephemeral node identifiers.
//!
//! A node id has the form `entropy:timestamp` where `entropy` is 16 random
//! bytes rendered as 32 lowercase hex digits and `timestamp` is the creation
//! wall clock in milliseconds, rendered as lowercase hex without fixed width.
//! Ids are never persisted; a fresh one is drawn per session.

use std::fmt;

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Random bytes in the entropy portion.
pub const ENTROPY_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Draw a fresh id stamped with the current wall clock.
    ///
    /// Fails only if the OS RNG fails, which callers must treat as fatal.
    pub fn generate() -> Result<Self, ProtocolError> {
        Self::generate_at(crate::now_ms())
    }

    /// Draw a fresh id with an explicit creation timestamp.
    pub fn generate_at(timestamp_ms: u64) -> Result<Self, ProtocolError> {
        let mut entropy = [0u8; ENTROPY_BYTES];
        OsRng
            .try_fill_bytes(&mut entropy)
            .map_err(|err| ProtocolError::Rng(err.to_string()))?;
        Ok(NodeId(format!("{}:{timestamp_ms:x}", hex::encode(entropy))))
    }

    /// Parse and validate a wire string as a node id.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        if Self::is_valid(s) {
            Ok(NodeId(s.to_owned()))
        } else {
            Err(ProtocolError::InvalidNodeId(s.to_owned()))
        }
    }

    /// True iff `s` matches `^[0-9a-f]{32}:[0-9a-f]+$`.
    pub fn is_valid(s: &str) -> bool {
        match s.split_once(':') {
            Some((entropy, timestamp)) => {
                entropy.len() == 2 * ENTROPY_BYTES
                    && entropy.bytes().all(is_lower_hex)
                    && !timestamp.is_empty()
                    && timestamp.bytes().all(is_lower_hex)
            }
            None => false,
        }
    }

    /// Creation timestamp embedded in the id.
    ///
    /// `None` when the id is malformed or the hex suffix overflows 64 bits.
    pub fn timestamp_ms(&self) -> Option<u64> {
        let (_, timestamp) = self.0.split_once(':')?;
        u64::from_str_radix(timestamp, 16).ok()
    }

    /// Milliseconds elapsed since the id was created.
    pub fn age_ms(&self, now_ms: u64) -> Option<u64> {
        self.timestamp_ms().map(|ts| now_ms.saturating_sub(ts))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_lower_hex(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn generated_id_has_expected_shape() {
        let id = NodeId::generate_at(1_700_000_000_000).unwrap();
        let (entropy, timestamp) = id.as_str().split_once(':').unwrap();

        assert_eq!(entropy.len(), 32);
        assert!(entropy.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(timestamp, "18c7eaf7000");
    }

    #[test]
    fn timestamp_round_trips() {
        let id = NodeId::generate_at(123_456).unwrap();
        assert_eq!(id.timestamp_ms(), Some(123_456));

        let reparsed = NodeId::parse(id.as_str()).unwrap();
        assert_eq!(reparsed, id);
    }

    #[test]
    fn age_is_relative_to_creation() {
        let id = NodeId::generate_at(1_000).unwrap();
        assert_eq!(id.age_ms(4_500), Some(3_500));
        // Clock skew never underflows.
        assert_eq!(id.age_ms(500), Some(0));
    }

    #[rstest]
    #[case("", false)]
    #[case("deadbeef:1a2b", false)] // entropy too short
    #[case("00112233445566778899aabbccddeeff:", false)] // missing timestamp
    #[case("00112233445566778899aabbccddeeff:1a2b", true)]
    #[case("00112233445566778899AABBCCDDEEFF:1a2b", false)] // uppercase
    #[case("00112233445566778899aabbccddeeff:1A2B", false)]
    #[case("00112233445566778899aabbccddeegg:1a2b", false)] // non-hex
    #[case("00112233445566778899aabbccddeeff", false)] // no separator
    #[case("00112233445566778899aabbccddeeff:1a2b:3c", false)] // extra field
    fn validation_cases(#[case] input: &str, #[case] valid: bool) {
        assert_eq!(NodeId::is_valid(input), valid, "input: {input:?}");
        assert_eq!(NodeId::parse(input).is_ok(), valid);
    }

    #[test]
    fn ids_are_unique() {
        let a = NodeId::generate().unwrap();
        let b = NodeId::generate().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn serde_is_transparent() {
        let id = NodeId::generate_at(255).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_str()));

        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
