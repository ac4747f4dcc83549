//! Node error types

use thiserror::Error;

/// Node error types
#[derive(Debug, Error)]
pub enum NodeError {
    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] bidmesh_storage::StorageError),
    /// Network error
    #[error("network error: {0}")]
    Network(#[from] bidmesh_network::NetworkError),
    /// Auction rule violation or failure
    #[error(transparent)]
    Auction(#[from] bidmesh_auction::AuctionError),
    /// Configuration error
    #[error("config error: {0}")]
    Config(String),
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;
