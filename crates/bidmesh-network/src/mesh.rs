//! Full-mesh formation and the per-node link set

use crate::dispatch::Dispatcher;
use crate::error::NetworkResult;
use crate::identity::{Identity, NodeKey};
use crate::link::{self, LinkContext, LinkEvent, PeerLink};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Mesh configuration
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Bound on every remote operation
    pub request_timeout: Duration,
    /// Bound on dialing and authenticating a link
    pub handshake_timeout: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Owner of a node's link set.
///
/// Of any two nodes only the one with the smaller identity dials, so a pair
/// never ends up with two competing links.
pub struct MeshManager {
    ctx: LinkContext,
    config: MeshConfig,
    links: RwLock<HashMap<Identity, Arc<PeerLink>>>,
    dialing: Mutex<HashSet<Identity>>,
    endpoints: RwLock<BTreeMap<Identity, String>>,
    cancel: CancellationToken,
}

impl MeshManager {
    /// Create a mesh manager; link close events arrive on the returned receiver
    pub fn new(
        key: Arc<NodeKey>,
        dispatcher: Arc<Dispatcher>,
        config: MeshConfig,
    ) -> (Arc<Self>, mpsc::Receiver<LinkEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let ctx = LinkContext::new(key, dispatcher, events_tx, config.handshake_timeout);
        let mesh = Arc::new(Self {
            ctx,
            config,
            links: RwLock::new(HashMap::new()),
            dialing: Mutex::new(HashSet::new()),
            endpoints: RwLock::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
        });
        (mesh, events_rx)
    }

    /// Own identity
    pub fn identity(&self) -> &Identity {
        self.ctx.key.identity()
    }

    /// Configuration
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Accept mesh links on `addr`; returns the bound address
    pub async fn listen(self: &Arc<Self>, addr: &str) -> NetworkResult<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!("Mesh listening on {}", local);

        let mesh = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = mesh.cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let mesh = mesh.clone();
                            tokio::spawn(async move {
                                match link::accept(stream, &mesh.ctx).await {
                                    Ok(link) => mesh.register(link),
                                    Err(e) => warn!("Rejected mesh link from {}: {}", remote, e),
                                }
                            });
                        }
                        Err(e) => error!("Mesh accept error: {}", e),
                    },
                }
            }
            debug!("Mesh accept loop stopped");
        });

        Ok(local)
    }

    /// Remember where registered identities accept links
    pub fn update_endpoints(&self, endpoints: &BTreeMap<Identity, String>) {
        let mut known = self.endpoints.write();
        for (id, endpoint) in endpoints {
            known.insert(id.clone(), endpoint.clone());
        }
    }

    /// Whether this node is responsible for dialing `peer`
    pub fn dials(&self, peer: &Identity) -> bool {
        self.identity() < peer
    }

    /// Link to every listed identity we own the dial for and are not yet
    /// linked to. Dials run concurrently; returns the newly linked peers.
    pub async fn on_peer_list_received(self: &Arc<Self>, identities: &[Identity]) -> Vec<Identity> {
        let mut targets: Vec<(Identity, String)> = Vec::new();
        {
            let links = self.links.read();
            let endpoints = self.endpoints.read();
            let mut dialing = self.dialing.lock();
            for id in identities {
                if !self.dials(id) || links.contains_key(id) || dialing.contains(id) {
                    continue;
                }
                match endpoints.get(id) {
                    Some(endpoint) => {
                        dialing.insert(id.clone());
                        targets.push((id.clone(), endpoint.clone()));
                    }
                    None => debug!(peer = %id.short(), "no endpoint known, not dialing"),
                }
            }
        }

        let dials = targets.into_iter().map(|(peer, endpoint)| {
            let mesh = self.clone();
            async move {
                let result = link::connect(&endpoint, Some(&peer), &mesh.ctx).await;
                mesh.dialing.lock().remove(&peer);
                match result {
                    Ok(link) => {
                        mesh.register(link);
                        Some(peer)
                    }
                    Err(e) => {
                        warn!(peer = %peer.short(), endpoint = %endpoint, "dial failed: {}", e);
                        None
                    }
                }
            }
        });

        join_all(dials).await.into_iter().flatten().collect()
    }

    /// Insert an established link, closing any link it replaces
    pub fn register(&self, link: Arc<PeerLink>) {
        let previous = self
            .links
            .write()
            .insert(link.identity().clone(), link.clone());
        if let Some(previous) = previous {
            debug!(
                peer = %link.identity().short(),
                old = previous.link_id(),
                new = link.link_id(),
                "replacing mesh link"
            );
            previous.close();
        }
        info!(peer = %link.identity().short(), links = self.link_count(), "peer linked");
    }

    /// Drop the entry for a closed link.
    ///
    /// Returns the identities still reachable (remaining links and self) when
    /// the entry was removed, or `None` for a link that was already replaced.
    pub fn on_link_closed(&self, identity: &Identity, link_id: u64) -> Option<Vec<Identity>> {
        let mut links = self.links.write();
        match links.get(identity) {
            Some(current) if current.link_id() == link_id => {
                links.remove(identity);
            }
            _ => {
                debug!(peer = %identity.short(), link_id, "ignoring close of stale link");
                return None;
            }
        }

        let mut reachable: Vec<Identity> = links.keys().cloned().collect();
        drop(links);
        reachable.push(self.identity().clone());
        reachable.sort();
        info!(peer = %identity.short(), remaining = reachable.len() - 1, "peer unlinked");
        Some(reachable)
    }

    /// Identities with an open link
    pub fn linked_peers(&self) -> Vec<Identity> {
        let mut peers: Vec<Identity> = self.links.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Whether `peer` is linked
    pub fn is_linked(&self, peer: &Identity) -> bool {
        self.links.read().contains_key(peer)
    }

    /// Number of open links
    pub fn link_count(&self) -> usize {
        self.links.read().len()
    }

    /// Snapshot of all open links
    pub fn links(&self) -> Vec<Arc<PeerLink>> {
        self.links.read().values().cloned().collect()
    }

    /// Link to `peer`, if any
    pub fn link(&self, peer: &Identity) -> Option<Arc<PeerLink>> {
        self.links.read().get(peer).cloned()
    }

    /// Stop listening and close every link
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for link in self.links.write().drain().map(|(_, link)| link) {
            link.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh(seed: u8) -> (Arc<MeshManager>, mpsc::Receiver<LinkEvent>) {
        let key = Arc::new(NodeKey::from_seed(&[seed; 32]).unwrap());
        MeshManager::new(key, Arc::new(Dispatcher::new()), MeshConfig::default())
    }

    /// Two meshes where the first owns the dial
    async fn ordered_pair() -> (
        (Arc<MeshManager>, mpsc::Receiver<LinkEvent>),
        (Arc<MeshManager>, mpsc::Receiver<LinkEvent>),
        SocketAddr,
    ) {
        let a = mesh(1);
        let b = mesh(2);
        let (low, high) = if a.0.identity() < b.0.identity() { (a, b) } else { (b, a) };
        let addr = high.0.listen("127.0.0.1:0").await.unwrap();
        (low, high, addr)
    }

    async fn wait_linked(mesh: &MeshManager, peer: &Identity) {
        for _ in 0..100 {
            if mesh.is_linked(peer) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{:?} never linked to {:?}", mesh.identity(), peer);
    }

    #[test]
    fn test_dial_ownership_is_asymmetric() {
        let (a, _) = mesh(1);
        let (b, _) = mesh(2);
        assert_ne!(a.dials(b.identity()), b.dials(a.identity()));
        assert!(!a.dials(a.identity()));
    }

    #[tokio::test]
    async fn test_peer_list_links_both_sides() {
        let ((low, _low_events), (high, _high_events), addr) = ordered_pair().await;

        let mut endpoints = BTreeMap::new();
        endpoints.insert(high.identity().clone(), addr.to_string());
        low.update_endpoints(&endpoints);

        let list = vec![low.identity().clone(), high.identity().clone()];
        let linked = low.on_peer_list_received(&list).await;
        assert_eq!(linked, vec![high.identity().clone()]);

        wait_linked(&high, low.identity()).await;
        assert_eq!(low.linked_peers(), vec![high.identity().clone()]);

        // Already linked: nothing more to dial
        assert!(low.on_peer_list_received(&list).await.is_empty());
        // The higher identity never dials
        assert!(high.on_peer_list_received(&list).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_endpoint_skipped() {
        let (a, _) = mesh(1);
        let (b, _) = mesh(2);
        let (low, high) = if a.identity() < b.identity() { (a, b) } else { (b, a) };
        let linked = low.on_peer_list_received(&[high.identity().clone()]).await;
        assert!(linked.is_empty());
        assert_eq!(low.link_count(), 0);
    }

    #[tokio::test]
    async fn test_link_closed_reports_reachable() {
        let ((low, mut low_events), (high, mut high_events), addr) = ordered_pair().await;
        let mut endpoints = BTreeMap::new();
        endpoints.insert(high.identity().clone(), addr.to_string());
        low.update_endpoints(&endpoints);
        low.on_peer_list_received(&[high.identity().clone()]).await;
        wait_linked(&high, low.identity()).await;

        high.shutdown();

        let LinkEvent::Closed { identity, link_id } = low_events.recv().await.unwrap();
        assert_eq!(&identity, high.identity());
        let reachable = low.on_link_closed(&identity, link_id).unwrap();
        assert_eq!(reachable, vec![low.identity().clone()]);
        assert_eq!(low.link_count(), 0);

        // A second close for the same link is stale
        assert!(low.on_link_closed(&identity, link_id).is_none());

        // The shut-down side also observes its link closing
        assert!(matches!(
            high_events.recv().await,
            Some(LinkEvent::Closed { .. })
        ));
    }
}
