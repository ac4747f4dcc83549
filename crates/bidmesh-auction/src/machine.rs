//! Per-item auction state machine

use crate::error::{AuctionError, AuctionResult};
use crate::outcome::{BidOutcome, CloseOutcome, Notice, OpenOutcome, RemoteOutcome};
use crate::policy::ValidationPolicy;
use crate::record::{AuctionRecord, BidEvent, CloseEvent, OpenEvent, OP_BID, OP_CLOSE, OP_OPEN};
use bidmesh_network::{BroadcastReport, Broadcaster, Identity, RequestContext};
use bidmesh_storage::{KeyValueStore, KeyValueStoreExt};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Notice channel depth
const NOTICE_CAPACITY: usize = 256;

/// Replicated auction state of one node.
///
/// Each item moves `NoAuction -> Open -> (deleted)` from this node's point of
/// view. Writes to one item are serialised by a per-item lock; the guard on
/// this node's own auction is always taken before any item lock.
///
/// Local operations commit their state change and release every lock before
/// broadcasting, so two nodes broadcasting to each other never wait on one
/// another's locks.
pub struct AuctionStateMachine {
    identity: Identity,
    store: Arc<dyn KeyValueStore>,
    broadcaster: Arc<dyn Broadcaster>,
    policy: ValidationPolicy,
    item_locks: DashMap<String, Arc<Mutex<()>>>,
    own_auction: Mutex<Option<String>>,
    notices: broadcast::Sender<Notice>,
}

impl AuctionStateMachine {
    /// Create a state machine
    pub fn new(
        identity: Identity,
        store: Arc<dyn KeyValueStore>,
        broadcaster: Arc<dyn Broadcaster>,
        policy: ValidationPolicy,
    ) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            identity,
            store,
            broadcaster,
            policy,
            item_locks: DashMap::new(),
            own_auction: Mutex::new(None),
            notices,
        }
    }

    /// Own identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Active validation policy
    pub fn policy(&self) -> ValidationPolicy {
        self.policy
    }

    /// Receive notices about peer activity
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Item of this node's open auction, if any
    pub async fn own_auction(&self) -> Option<String> {
        self.own_auction.lock().await.clone()
    }

    /// Record for `item`, if its auction is open here
    pub fn show(&self, item: &str) -> AuctionResult<Option<AuctionRecord>> {
        Ok(self.store.get_json(item)?)
    }

    /// Every open auction known here, ordered by item
    pub fn open_auctions(&self) -> AuctionResult<Vec<(String, AuctionRecord)>> {
        let mut auctions = Vec::new();
        for item in self.store.keys()? {
            if let Some(record) = self.store.get_json::<AuctionRecord>(&item)? {
                auctions.push((item, record));
            }
        }
        Ok(auctions)
    }

    /// Restore the own-auction guard from records this node opened before a
    /// restart; returns the resumed item
    pub async fn recover(&self) -> AuctionResult<Option<String>> {
        let mut mine = self
            .open_auctions()?
            .into_iter()
            .filter(|(_, record)| record.is_auctioneer(&self.identity))
            .map(|(item, _)| item);

        let mut own = self.own_auction.lock().await;
        *own = mine.next();
        let rest: Vec<String> = mine.collect();
        if !rest.is_empty() {
            warn!(items = ?rest, "more than one stored auction of ours; only the first can be closed");
        }
        if let Some(item) = own.as_ref() {
            info!(item = %item, "resumed own auction");
        }
        Ok(own.clone())
    }

    async fn lock_item(&self, item: &str) -> ItemGuard<'_> {
        let lock = self.item_locks.entry(item.to_string()).or_default().clone();
        ItemGuard {
            locks: &self.item_locks,
            item: item.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn notify(&self, notice: Notice) {
        // No subscribers is fine
        let _ = self.notices.send(notice);
    }

    async fn announce<T: Serialize>(&self, op: &str, event: &T) -> AuctionResult<BroadcastReport> {
        let payload =
            serde_json::to_value(event).map_err(|e| AuctionError::InvalidPayload(e.to_string()))?;
        Ok(self.broadcaster.broadcast(op, payload).await)
    }

    // ==================== Local operations ====================

    /// Open an auction for `item` at `price`
    pub async fn open_local(&self, item: &str, price: f64) -> AuctionResult<OpenOutcome> {
        validate_item(item)?;
        validate_price(price)?;

        {
            let mut own = self.own_auction.lock().await;
            if let Some(current) = own.as_ref() {
                return Err(AuctionError::AlreadyAuctioning(current.clone()));
            }

            let _item = self.lock_item(item).await;
            if self.policy.is_strict() && self.show(item)?.is_some() {
                return Err(AuctionError::ItemAlreadyOpen(item.to_string()));
            }

            self.store
                .put_json(item, &AuctionRecord::opened(price, self.identity.clone()))?;
            *own = Some(item.to_string());
        }

        info!(item = %item, price, "auction opened");
        let event = OpenEvent {
            item: item.to_string(),
            price,
            auctioner_id: self.identity.clone(),
        };
        let report = self.announce(OP_OPEN, &event).await?;

        Ok(OpenOutcome {
            item: event.item,
            price,
            report,
        })
    }

    /// Bid `price` on `item`
    pub async fn bid_local(&self, item: &str, price: f64) -> AuctionResult<BidOutcome> {
        validate_item(item)?;
        validate_price(price)?;

        let previous = {
            let _item = self.lock_item(item).await;

            let record: AuctionRecord = self
                .show(item)?
                .ok_or_else(|| AuctionError::NoSuchAuction(item.to_string()))?;
            if price <= record.top_price {
                return Err(AuctionError::BidTooLow {
                    item: item.to_string(),
                    price,
                    top: record.top_price,
                });
            }

            self.store
                .put_json(item, &record.with_bid(price, self.identity.clone()))?;
            record.top_price
        };

        info!(item = %item, price, previous, "bid placed");
        let event = BidEvent {
            item: item.to_string(),
            price,
            bidder_id: self.identity.clone(),
        };
        let report = self.announce(OP_BID, &event).await?;

        Ok(BidOutcome {
            item: event.item,
            price,
            previous,
            report,
        })
    }

    /// Close this node's auction for `item` and report the winner
    pub async fn close_local(&self, item: &str) -> AuctionResult<CloseOutcome> {
        let record = {
            let mut own = self.own_auction.lock().await;
            match own.as_deref() {
                None => return Err(AuctionError::NoOpenAuction),
                Some(current) if current != item => {
                    return Err(AuctionError::NotAuctioneer(item.to_string()))
                }
                Some(_) => {}
            }

            let _item = self.lock_item(item).await;
            let record = match self.show(item)? {
                Some(record) => record,
                None => {
                    // Removed behind our back by a trusted peer's close
                    *own = None;
                    return Err(AuctionError::NoSuchAuction(item.to_string()));
                }
            };

            self.store.delete(item)?;
            *own = None;
            record
        };

        match &record.top_bidder_id {
            Some(winner) => info!(item = %item, price = record.top_price, winner = %winner.short(), "auction closed"),
            None => info!(item = %item, price = record.top_price, "auction closed without bids"),
        }
        let event = CloseEvent {
            item: item.to_string(),
            price: record.top_price,
            bidder_id: record.top_bidder_id.clone(),
        };
        let report = self.announce(OP_CLOSE, &event).await?;

        Ok(CloseOutcome {
            item: event.item,
            price: event.price,
            winner: event.bidder_id,
            report,
        })
    }

    // ==================== Remote events ====================

    /// Strict policy: the request and the claim inside it must both name the
    /// authenticated peer
    fn claim_matches(&self, ctx: &RequestContext, claimed: &Identity) -> bool {
        !self.policy.is_strict() || (ctx.caller_is_peer() && &ctx.peer == claimed)
    }

    fn reject(&self, ctx: &RequestContext, op: &str, item: &str, reason: String) -> RemoteOutcome {
        warn!(op = %op, item = %item, peer = %ctx.peer.short(), "ignoring remote event: {}", reason);
        self.notify(Notice::Ignored {
            op: op.to_string(),
            item: item.to_string(),
            from: ctx.peer.clone(),
            reason: reason.clone(),
        });
        RemoteOutcome::ignored(reason)
    }

    /// A peer opened an auction; last writer wins
    pub async fn on_remote_open(
        &self,
        ctx: &RequestContext,
        event: OpenEvent,
    ) -> AuctionResult<RemoteOutcome> {
        if !self.claim_matches(ctx, &event.auctioner_id) {
            return Ok(self.reject(ctx, OP_OPEN, &event.item, "auctioneer claim does not match link".into()));
        }
        if !event.price.is_finite() {
            return Ok(self.reject(ctx, OP_OPEN, &event.item, format!("invalid price {}", event.price)));
        }

        {
            let _item = self.lock_item(&event.item).await;
            self.store.put_json(
                &event.item,
                &AuctionRecord::opened(event.price, event.auctioner_id.clone()),
            )?;
        }

        debug!(item = %event.item, price = event.price, "remote auction opened");
        self.notify(Notice::Opened {
            item: event.item,
            price: event.price,
            auctioneer: event.auctioner_id,
        });
        Ok(RemoteOutcome::Opened)
    }

    /// A peer bid. Strict: only raises of an existing record are applied.
    /// Trusting: the record is overwritten as sent.
    pub async fn on_remote_bid(
        &self,
        ctx: &RequestContext,
        event: BidEvent,
    ) -> AuctionResult<RemoteOutcome> {
        if !self.claim_matches(ctx, &event.bidder_id) {
            return Ok(self.reject(ctx, OP_BID, &event.item, "bidder claim does not match link".into()));
        }

        {
            let _item = self.lock_item(&event.item).await;
            let current: Option<AuctionRecord> = self.show(&event.item)?;

            let next = match (self.policy, current) {
                (ValidationPolicy::Strict, None) => {
                    return Ok(self.reject(ctx, OP_BID, &event.item, "no open auction".into()));
                }
                (ValidationPolicy::Strict, Some(record)) if event.price <= record.top_price => {
                    return Ok(self.reject(
                        ctx,
                        OP_BID,
                        &event.item,
                        format!("bid {} does not beat top price {}", event.price, record.top_price),
                    ));
                }
                (_, Some(record)) => record.with_bid(event.price, event.bidder_id.clone()),
                (ValidationPolicy::Trusting, None) => AuctionRecord {
                    top_price: event.price,
                    top_bidder_id: Some(event.bidder_id.clone()),
                    auctioneer_id: None,
                },
            };
            self.store.put_json(&event.item, &next)?;
        }

        debug!(item = %event.item, price = event.price, "remote bid applied");
        self.notify(Notice::Bid {
            item: event.item,
            price: event.price,
            bidder: event.bidder_id,
        });
        Ok(RemoteOutcome::BidAccepted)
    }

    /// A peer closed an auction. No-op without a record; Strict also
    /// requires the closer to be the recorded auctioneer.
    pub async fn on_remote_close(
        &self,
        ctx: &RequestContext,
        event: CloseEvent,
    ) -> AuctionResult<RemoteOutcome> {
        if self.policy.is_strict() && !ctx.caller_is_peer() {
            return Ok(self.reject(ctx, OP_CLOSE, &event.item, "caller claim does not match link".into()));
        }

        {
            let mut own = self.own_auction.lock().await;
            let _item = self.lock_item(&event.item).await;

            let record: AuctionRecord = match self.show(&event.item)? {
                Some(record) => record,
                None => {
                    debug!(item = %event.item, "close for unknown auction");
                    return Ok(RemoteOutcome::ignored("no open auction"));
                }
            };
            if self.policy.is_strict() && !record.is_auctioneer(&ctx.peer) {
                return Ok(self.reject(ctx, OP_CLOSE, &event.item, "only the auctioneer may close".into()));
            }

            self.store.delete(&event.item)?;
            if own.as_deref() == Some(event.item.as_str()) {
                *own = None;
            }
        }

        let you_won = event.bidder_id.as_ref() == Some(&self.identity);
        if you_won {
            info!(item = %event.item, price = event.price, "won auction");
        } else {
            debug!(item = %event.item, "remote auction closed");
        }
        self.notify(Notice::Closed {
            item: event.item,
            price: event.price,
            winner: event.bidder_id.clone(),
            you_won,
        });
        Ok(RemoteOutcome::Closed {
            winner: event.bidder_id,
            you_won,
        })
    }

    /// Decode `payload` and route it to the handler for `op`
    pub async fn apply_remote(
        &self,
        ctx: &RequestContext,
        op: &str,
        payload: Value,
    ) -> AuctionResult<RemoteOutcome> {
        fn decode<T: serde::de::DeserializeOwned>(payload: Value) -> AuctionResult<T> {
            serde_json::from_value(payload).map_err(|e| AuctionError::InvalidPayload(e.to_string()))
        }

        match op {
            OP_OPEN => self.on_remote_open(ctx, decode(payload)?).await,
            OP_BID => self.on_remote_bid(ctx, decode(payload)?).await,
            OP_CLOSE => self.on_remote_close(ctx, decode(payload)?).await,
            other => Err(AuctionError::InvalidPayload(format!("unknown operation {}", other))),
        }
    }
}

fn validate_price(price: f64) -> AuctionResult<()> {
    if !price.is_finite() || price < 0.0 {
        return Err(AuctionError::InvalidPrice(price.to_string()));
    }
    Ok(())
}

fn validate_item(item: &str) -> AuctionResult<()> {
    if item.is_empty() || item.chars().any(char::is_whitespace) {
        return Err(AuctionError::InvalidItem(item.to_string()));
    }
    Ok(())
}

/// Holds one item's lock; the map entry goes away with the last holder
struct ItemGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    item: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ItemGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Checked under the shard lock, so no waiter can be holding a clone
        self.locks
            .remove_if(&self.item, |_, lock| Arc::strong_count(lock) == 1);
    }
}
