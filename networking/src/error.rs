//! Error types for the networking crate.

use thiserror::Error;

/// Errors surfaced by transports, the connection manager and the
/// orchestrator.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Malformed node id handed in by a caller; rejected synchronously.
    #[error("invalid node id: {0:?}")]
    InvalidId(String),

    /// Neither the direct transport nor any relay endpoint could be opened.
    #[error("no transport available: {0}")]
    TransportUnavailable(String),

    /// Mid-session transport failure; the peer record is dropped.
    #[error("transport error: {0}")]
    Transport(String),

    /// Structural or semantic message error, including expiry.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Authentication tag mismatch or key-agreement failure.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Already-seen `(sender, nonce)` pair; dropped silently.
    #[error("duplicate message")]
    Duplicate,

    /// An extension handler failed; logged, never fatal to the pipeline.
    #[error("extension {id} failed: {reason}")]
    Extension { id: String, reason: String },

    /// The orchestrator has shut down; late handles refuse new work.
    #[error("node has shut down")]
    ShutDown,

    /// RNG or key failure during start-up; aborts initialization.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<protocol::ProtocolError> for NetworkError {
    fn from(err: protocol::ProtocolError) -> Self {
        match err {
            protocol::ProtocolError::InvalidNodeId(id) => NetworkError::InvalidId(id),
            other => NetworkError::Fatal(other.to_string()),
        }
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;
