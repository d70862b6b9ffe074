//! Intent-derived routing tags.
//!
//! A resonance key is the full SHA-256 of the intent string and routes
//! interest-based traffic; a whisper tag is a short truncated-digest
//! fingerprint used for coarse categorization. Both are deterministic, so
//! every node derives the same tag from the same intent.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const RESONANCE_KEY_BYTES: usize = 32;
pub const WHISPER_TAG_BYTES: usize = 8;

/// SHA-256 of the UTF-8 intent, carried as an array of u8 on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResonanceKey(pub [u8; RESONANCE_KEY_BYTES]);

impl ResonanceKey {
    pub fn as_bytes(&self) -> &[u8; RESONANCE_KEY_BYTES] {
        &self.0
    }
}

impl fmt::Debug for ResonanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResonanceKey({}…)", &hex::encode(&self.0[..4]))
    }
}

/// Derive the routing key for an intent. Pure and total.
pub fn derive_resonance_key(intent: &str) -> ResonanceKey {
    ResonanceKey(Sha256::digest(intent.as_bytes()).into())
}

/// First 8 bytes of a SHA-256, rendered as 16 lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WhisperTag(String);

impl WhisperTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WhisperTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint a topic, optionally mixing in structured metadata.
///
/// The metadata is folded in through its canonical JSON encoding (object
/// keys sorted), so equal metadata yields equal tags regardless of how the
/// value was built.
pub fn generate_whisper_tag(topic: &str, metadata: Option<&serde_json::Value>) -> WhisperTag {
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    if let Some(meta) = metadata {
        let canonical =
            serde_json::to_string(meta).expect("JSON value serialization cannot fail");
        hasher.update(canonical.as_bytes());
    }
    let digest = hasher.finalize();
    WhisperTag(hex::encode(&digest[..WHISPER_TAG_BYTES]))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn resonance_key_is_deterministic() {
        let a = derive_resonance_key("file:sync");
        let b = derive_resonance_key("file:sync");
        assert_eq!(a, b);
        assert_eq!(a.as_bytes().len(), RESONANCE_KEY_BYTES);
    }

    #[test]
    fn distinct_intents_produce_distinct_keys() {
        assert_ne!(
            derive_resonance_key("mining:coord"),
            derive_resonance_key("file:sync")
        );
    }

    #[test]
    fn resonance_key_serializes_as_byte_array() {
        let key = derive_resonance_key("default");
        let json = serde_json::to_string(&key).unwrap();
        let values: Vec<u8> = serde_json::from_str(&json).unwrap();
        assert_eq!(values, key.as_bytes().to_vec());
    }

    #[test]
    fn whisper_tag_is_sixteen_hex_digits() {
        let tag = generate_whisper_tag("default", None);
        assert_eq!(tag.as_str().len(), 2 * WHISPER_TAG_BYTES);
        assert!(tag.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn metadata_changes_the_tag() {
        let bare = generate_whisper_tag("topic", None);
        let tagged = generate_whisper_tag("topic", Some(&json!({"channel": 3})));
        assert_ne!(bare, tagged);

        // Equal metadata values hash equally.
        let again = generate_whisper_tag("topic", Some(&json!({"channel": 3})));
        assert_eq!(tagged, again);
    }
}
