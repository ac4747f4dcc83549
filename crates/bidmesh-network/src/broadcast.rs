//! Best-effort fan-out of named operations to every linked peer

use crate::identity::Identity;
use crate::link::PeerLink;
use crate::mesh::MeshManager;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of one broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers that acknowledged the operation
    pub delivered: Vec<Identity>,
    /// Peers that could not be reached, with the reason
    pub failed: Vec<(Identity, String)>,
}

impl BroadcastReport {
    /// Number of peers attempted
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    /// Whether every attempted delivery succeeded
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Something that can send an operation to all current peers
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Invoke `op` with `payload` on every peer. Never fails as a whole;
    /// per-peer failures are logged and reported.
    async fn broadcast(&self, op: &str, payload: Value) -> BroadcastReport;
}

/// Issue `op` on every link concurrently, each bounded by `timeout`
pub async fn fan_out(
    links: Vec<Arc<PeerLink>>,
    op: &str,
    payload: &Value,
    timeout: Duration,
) -> BroadcastReport {
    let calls = links.iter().map(|link| async move {
        let result = link.call(op, payload.clone(), timeout).await;
        (link.identity().clone(), result)
    });

    let mut report = BroadcastReport::default();
    for (peer, result) in join_all(calls).await {
        match result {
            Ok(_) => report.delivered.push(peer),
            Err(e) => {
                warn!(peer = %peer.short(), op = %op, "delivery failed: {}", e);
                report.failed.push((peer, e.to_string()));
            }
        }
    }

    debug!(
        op = %op,
        delivered = report.delivered.len(),
        failed = report.failed.len(),
        "broadcast finished"
    );
    report
}

#[async_trait]
impl Broadcaster for MeshManager {
    async fn broadcast(&self, op: &str, payload: Value) -> BroadcastReport {
        fan_out(self.links(), op, &payload, self.config().request_timeout).await
    }
}
