//! Error types for the Clearway protocol layer.

use thiserror::Error;

/// Errors surfaced by the Clearway client and core primitives.
#[derive(Debug, Error)]
pub enum ClearwayError {
    /// Protocol-level error (malformed envelope, invalid state transition).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport error (socket, I/O).
    #[error("transport error: {0}")]
    Transport(String),

    /// Cryptographic error (key material, signature encoding).
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A lifecycle operation was attempted before the handshake completed.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Submit/close attempted without a known active session.
    #[error("no active session")]
    NoActiveSession,

    /// The signer declined to sign (e.g. the user rejected the prompt).
    #[error("signature rejected by signer")]
    SignatureRejected,

    /// No matching response arrived within the configured budget.
    #[error("timed out after {0:?} waiting for relay response")]
    Timeout(std::time::Duration),

    /// The relay answered with an explicit error envelope.
    #[error("relay error: {0}")]
    Relay(String),

    /// A same-kind operation is already in flight.
    #[error("operation already in progress: {0}")]
    Busy(&'static str),

    /// Local keystore read/write failure.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type alias for Clearway operations.
pub type ClearwayResult<T> = Result<T, ClearwayError>;
