//! X25519 key material.
//!
//! One key pair is drawn per session and discarded on shutdown. Public keys
//! travel on the wire as raw 32-byte arrays; the Diffie-Hellman output is
//! used directly as the symmetric key for the encryption envelope, so both
//! ends derive the same secret from their private half and the other's
//! public half.

use std::fmt;

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::ProtocolError;

pub const PUBLIC_KEY_BYTES: usize = 32;
pub const SHARED_SECRET_BYTES: usize = 32;

/// Raw X25519 public key as exchanged on the wire (array of u8 in JSON).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_BYTES]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        let bytes = hex::decode(s).map_err(|_| ProtocolError::InvalidKeyLength(s.len()))?;
        let array: [u8; PUBLIC_KEY_BYTES] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::InvalidKeyLength(bytes.len()))?;
        Ok(PublicKey(array))
    }
}

impl From<[u8; PUBLIC_KEY_BYTES]> for PublicKey {
    fn from(bytes: [u8; PUBLIC_KEY_BYTES]) -> Self {
        PublicKey(bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}…)", &self.to_hex()[..8])
    }
}

/// Session key pair. The secret half never leaves this struct.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Draw a fresh pair from the OS RNG.
    ///
    /// Fails only if the OS RNG fails, which callers must treat as fatal.
    pub fn generate() -> Result<Self, ProtocolError> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|err| ProtocolError::Rng(err.to_string()))?;
        let secret = StaticSecret::from(seed);
        let public = PublicKey(X25519Public::from(&secret).to_bytes());
        Ok(KeyPair { secret, public })
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// 256-bit Diffie-Hellman secret with a peer.
    ///
    /// Depends only on the two key pairs, never on session state, so the
    /// result is stable across reconnects and out-of-order deliveries.
    pub fn shared_secret(&self, peer: &PublicKey) -> [u8; SHARED_SECRET_BYTES] {
        self.secret
            .diffie_hellman(&X25519Public::from(peer.0))
            .to_bytes()
    }
}

// Secret halves never appear in logs.
impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair(public={:?}, secret=***)", self.public)
    }
}
