//! Network error types

use thiserror::Error;

/// Network errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] bidmesh_storage::StorageError),

    /// Connection failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer not found
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// Handshake failed
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Remote side authenticated as someone other than expected
    #[error("identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch {
        /// Identity we dialed
        expected: String,
        /// Identity the peer proved
        actual: String,
    },

    /// Invalid message
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Message with an unknown discriminant
    #[error("unknown message discriminant: {0}")]
    UnknownDiscriminant(String),

    /// Frame codec error
    #[error("codec error: {0}")]
    Codec(String),

    /// Crypto error
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Timeout
    #[error("timeout: {0}")]
    Timeout(String),

    /// Remote operation returned an error
    #[error("remote error: {0}")]
    Remote(String),

    /// Channel closed
    #[error("channel closed")]
    ChannelClosed,
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
