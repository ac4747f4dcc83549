//! Results of auction operations and notices for the operator

use bidmesh_network::{BroadcastReport, Identity};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A local open that was applied and broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOutcome {
    /// Item opened
    pub item: String,
    /// Opening price
    pub price: f64,
    /// Delivery to peers
    pub report: BroadcastReport,
}

/// A local bid that was applied and broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct BidOutcome {
    /// Item bid on
    pub item: String,
    /// Accepted price
    pub price: f64,
    /// Top price before the bid
    pub previous: f64,
    /// Delivery to peers
    pub report: BroadcastReport,
}

/// A local close that was applied and broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct CloseOutcome {
    /// Item sold
    pub item: String,
    /// Final price
    pub price: f64,
    /// Winning bidder, if anyone bid
    pub winner: Option<Identity>,
    /// Delivery to peers
    pub report: BroadcastReport,
}

/// What a node did with an event received from a peer.
///
/// Sent back as the response value, so the sender can tell delivery apart
/// from acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum RemoteOutcome {
    /// Record created or overwritten
    Opened,
    /// Record updated with the bid
    BidAccepted,
    /// Record deleted
    Closed {
        /// Winner as announced by the closer
        winner: Option<Identity>,
        /// Whether the winner is this node
        you_won: bool,
    },
    /// Event rejected; nothing changed
    Ignored {
        /// Why
        reason: String,
    },
}

impl RemoteOutcome {
    pub(crate) fn ignored(reason: impl Into<String>) -> Self {
        RemoteOutcome::Ignored {
            reason: reason.into(),
        }
    }
}

/// Something the operator should hear about, caused by a peer
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// A peer opened an auction
    Opened {
        /// Item
        item: String,
        /// Opening price
        price: f64,
        /// Auctioneer
        auctioneer: Identity,
    },
    /// A peer bid
    Bid {
        /// Item
        item: String,
        /// Offered price
        price: f64,
        /// Bidder
        bidder: Identity,
    },
    /// A peer closed an auction
    Closed {
        /// Item
        item: String,
        /// Final price
        price: f64,
        /// Winner
        winner: Option<Identity>,
        /// Whether the winner is this node
        you_won: bool,
    },
    /// A peer's event was rejected
    Ignored {
        /// Operation name
        op: String,
        /// Item
        item: String,
        /// Sending peer
        from: Identity,
        /// Why
        reason: String,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Opened {
                item,
                price,
                auctioneer,
            } => write!(f, "{} opened {} at {}", auctioneer.short(), item, price),
            Notice::Bid {
                item,
                price,
                bidder,
            } => write!(f, "{} bid {} on {}", bidder.short(), price, item),
            Notice::Closed {
                item,
                price,
                winner,
                you_won,
            } => {
                match winner {
                    Some(winner) => {
                        write!(f, "{} closed: sold to {} for {}", item, winner.short(), price)?
                    }
                    None => write!(f, "{} closed without bids", item)?,
                }
                if *you_won {
                    write!(f, " (you won)")?;
                }
                Ok(())
            }
            Notice::Ignored {
                op,
                item,
                from,
                reason,
            } => write!(f, "ignored {} on {} from {}: {}", op, item, from.short(), reason),
        }
    }
}
