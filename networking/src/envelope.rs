//! Per-peer encryption envelope.
//!
//! The X25519 shared secret keys a ChaCha20-Poly1305 cipher; each payload is
//! sealed as `nonce || ciphertext || tag` and base64-encoded into the
//! message's `payload` field. The secret is bound only to the two key pairs,
//! so a cached envelope decrypts out-of-order deliveries and reconnects
//! alike.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use protocol::{KeyPair, PublicKey};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::{NetworkError, NetworkResult};

/// 96-bit AEAD nonce.
pub const NONCE_BYTES: usize = 12;
/// 128-bit Poly1305 authentication tag.
pub const TAG_BYTES: usize = 16;

/// Cached cipher for one peer, derived once from the key agreement.
pub struct Envelope {
    cipher: ChaCha20Poly1305,
}

impl Envelope {
    pub fn new(local: &KeyPair, peer: &PublicKey) -> Self {
        let secret = local.shared_secret(peer);
        Envelope {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&secret)),
        }
    }

    /// Encrypt a plaintext into the base64 wire form.
    pub fn seal(&self, plaintext: &str) -> NetworkResult<String> {
        let mut nonce = [0u8; NONCE_BYTES];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|err| NetworkError::Fatal(format!("os rng failure: {err}")))?;

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| NetworkError::Fatal("encryption failure".to_owned()))?;

        let mut sealed = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(B64.encode(sealed))
    }

    /// Decrypt a base64 wire payload, rejecting tampered or misdirected
    /// ciphertexts.
    pub fn open(&self, payload: &str) -> NetworkResult<String> {
        let sealed = B64
            .decode(payload)
            .map_err(|err| NetworkError::Decryption(format!("malformed base64: {err}")))?;

        if sealed.len() < NONCE_BYTES + TAG_BYTES {
            return Err(NetworkError::Decryption("payload too short".to_owned()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_BYTES);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| NetworkError::Decryption("authentication tag mismatch".to_owned()))?;

        String::from_utf8(plaintext)
            .map_err(|_| NetworkError::Decryption("plaintext is not UTF-8".to_owned()))
    }
}
