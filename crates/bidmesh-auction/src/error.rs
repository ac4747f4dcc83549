//! Auction error types

use thiserror::Error;

/// Auction errors
///
/// Everything except [`AuctionError::Storage`] is a rule violation or bad
/// input: it is reported to the operator and changes nothing.
#[derive(Debug, Error)]
pub enum AuctionError {
    /// Price is not a finite, non-negative number
    #[error("invalid price: {0}")]
    InvalidPrice(String),

    /// Item name is unusable
    #[error("invalid item: {0:?}")]
    InvalidItem(String),

    /// This node already runs an auction
    #[error("already auctioning {0}")]
    AlreadyAuctioning(String),

    /// Another node's auction for this item is open
    #[error("an auction for {0} is already open")]
    ItemAlreadyOpen(String),

    /// No open auction for the item
    #[error("no open auction for {0}")]
    NoSuchAuction(String),

    /// Bid does not beat the current top price
    #[error("bid {price} on {item} does not beat top price {top}")]
    BidTooLow {
        /// Item bid on
        item: String,
        /// Offered price
        price: f64,
        /// Current top price
        top: f64,
    },

    /// This node has no self-initiated open auction
    #[error("no auction of ours is open")]
    NoOpenAuction,

    /// The item's auction was not opened by this node
    #[error("{0} is not our auction")]
    NotAuctioneer(String),

    /// Event payload could not be decoded
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] bidmesh_storage::StorageError),
}

impl AuctionError {
    /// Whether the error is the operator's or a peer's fault rather than a
    /// local failure
    pub fn is_rejection(&self) -> bool {
        !matches!(self, AuctionError::Storage(_))
    }
}

/// Result type for auction operations
pub type AuctionResult<T> = Result<T, AuctionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bid_too_low_message() {
        let err = AuctionError::BidTooLow {
            item: "widget".into(),
            price: 10.0,
            top: 12.5,
        };
        assert_eq!(
            err.to_string(),
            "bid 10 on widget does not beat top price 12.5"
        );
    }

    #[test]
    fn test_rejection_vs_failure() {
        assert!(AuctionError::NoOpenAuction.is_rejection());
        assert!(AuctionError::AlreadyAuctioning("lamp".into()).is_rejection());
        let err: AuctionError = bidmesh_storage::StorageError::NotOpen.into();
        assert!(!err.is_rejection());
    }
}
