//! Structural and semantic validation of message records.
//!
//! Validation never decrypts. Structural problems are errors; a protocol
//! version mismatch is only a warning so that newer peers keep talking to
//! older ones.

use crate::message::{Message, MessageBody, NONCE_BYTES};
use crate::node_id::NodeId;
use crate::{MessageKind, PROTOCOL_VERSION};

/// Outcome of validating one record.
#[derive(Debug, Clone, Default)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Message {
    /// Validate against the current wall clock.
    pub fn validate(&self) -> Validation {
        self.validate_at(crate::now_ms())
    }

    /// Validate against an explicit wall clock.
    pub fn validate_at(&self, now_ms: u64) -> Validation {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if !NodeId::is_valid(self.sender.as_str()) {
            errors.push(format!("malformed sender id: {:?}", self.sender.as_str()));
        }

        if self.nonce.len() != 2 * NONCE_BYTES
            || !self.nonce.bytes().all(|b| b.is_ascii_hexdigit())
        {
            errors.push("malformed nonce".to_owned());
        }

        if self.timestamp.checked_add(self.ttl).is_none() {
            errors.push("timestamp + ttl overflows".to_owned());
        }

        if now_ms.saturating_sub(self.timestamp) > self.ttl {
            errors.push("expired".to_owned());
        }

        if self.version != PROTOCOL_VERSION {
            warnings.push(format!(
                "protocol version mismatch: {} (local {PROTOCOL_VERSION})",
                self.version
            ));
        }

        match &self.body {
            MessageBody::Whisper { target_id } => {
                if !NodeId::is_valid(target_id.as_str()) {
                    errors.push(format!("malformed target id: {:?}", target_id.as_str()));
                }
            }
            MessageBody::Broadcast {
                max_hops,
                current_hops,
                seen_by,
            } => {
                if current_hops > max_hops {
                    errors.push(format!(
                        "current_hops {current_hops} exceeds max_hops {max_hops}"
                    ));
                }
                if !seen_by.contains(&self.sender) {
                    errors.push("sender missing from seen_by".to_owned());
                }
            }
            MessageBody::Resonance { intent, strength } => {
                if intent.is_empty() {
                    errors.push("empty resonance intent".to_owned());
                }
                if !(0.0..=1.0).contains(strength) {
                    errors.push(format!("strength {strength} outside [0, 1]"));
                }
            }
            _ => {}
        }

        Validation {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// True once `ttl` milliseconds have elapsed since `timestamp`.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(crate::now_ms())
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp) > self.ttl
    }

    /// True iff this is a resonance for `intent` at or above `min_strength`.
    pub fn matches_resonance(&self, intent: &str, min_strength: f64) -> bool {
        match &self.body {
            MessageBody::Resonance {
                intent: own,
                strength,
            } => self.kind() == MessageKind::Resonance && own == intent && *strength >= min_strength,
            _ => false,
        }
    }
}
