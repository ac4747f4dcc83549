//! Stored auction state and the events that change it

use bidmesh_network::Identity;
use serde::{Deserialize, Serialize};

/// Operation name of an open event
pub const OP_OPEN: &str = "open";
/// Operation name of a bid event
pub const OP_BID: &str = "bid";
/// Operation name of a close event
pub const OP_CLOSE: &str = "close";

/// Local view of one open auction, keyed by item in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionRecord {
    /// Highest accepted price so far (the opening price until someone bids)
    pub top_price: f64,
    /// Who holds the top bid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_bidder_id: Option<Identity>,
    /// Who opened the auction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auctioneer_id: Option<Identity>,
}

impl AuctionRecord {
    /// Freshly opened auction
    pub fn opened(price: f64, auctioneer: Identity) -> Self {
        Self {
            top_price: price,
            top_bidder_id: None,
            auctioneer_id: Some(auctioneer),
        }
    }

    /// Apply a bid, keeping the auctioneer
    pub fn with_bid(&self, price: f64, bidder: Identity) -> Self {
        Self {
            top_price: price,
            top_bidder_id: Some(bidder),
            auctioneer_id: self.auctioneer_id.clone(),
        }
    }

    /// Whether `identity` opened this auction
    pub fn is_auctioneer(&self, identity: &Identity) -> bool {
        self.auctioneer_id.as_ref() == Some(identity)
    }
}

/// `open {item, price, auctionerId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenEvent {
    /// Item put up for auction
    pub item: String,
    /// Opening price
    pub price: f64,
    /// Claimed auctioneer
    pub auctioner_id: Identity,
}

/// `bid {item, price, bidderId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidEvent {
    /// Item bid on
    pub item: String,
    /// Offered price
    pub price: f64,
    /// Claimed bidder
    pub bidder_id: Identity,
}

/// `close {item, price, bidderId}`; `bidderId` is the winner, if any
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseEvent {
    /// Item sold
    pub item: String,
    /// Final price
    pub price: f64,
    /// Winning bidder
    #[serde(default)]
    pub bidder_id: Option<Identity>,
}
