//! Error types for the protocol crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The string is not of the `entropy:timestamp` form.
    #[error("invalid node id: {0:?}")]
    InvalidNodeId(String),

    /// A key was not the expected 32 bytes.
    #[error("invalid public key length: {0}")]
    InvalidKeyLength(usize),

    /// The OS random number generator failed. Not recoverable.
    #[error("os rng failure: {0}")]
    Rng(String),
}
