//! # bidmesh-auction
//!
//! Replicated auctions over the bidmesh mesh.
//!
//! Each node keeps its own [`AuctionRecord`] per open item and applies events
//! from its peers. Local actions are validated, committed and then broadcast
//! best-effort; there is no consensus, so replicas that miss an event stay
//! stale.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod machine;
mod outcome;
mod policy;
mod record;
mod service;

pub use error::{AuctionError, AuctionResult};
pub use machine::AuctionStateMachine;
pub use outcome::{BidOutcome, CloseOutcome, Notice, OpenOutcome, RemoteOutcome};
pub use policy::ValidationPolicy;
pub use record::{AuctionRecord, BidEvent, CloseEvent, OpenEvent, OP_BID, OP_CLOSE, OP_OPEN};
pub use service::register_operations;
