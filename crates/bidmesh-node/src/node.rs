//! Node orchestration: identity, mesh, directory session and auctions

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::stores::Stores;
use bidmesh_auction::{
    register_operations, AuctionRecord, AuctionStateMachine, BidOutcome, CloseOutcome, Notice,
    OpenOutcome,
};
use bidmesh_network::{
    Broadcaster, DirectoryClient, DirectoryEvent, Dispatcher, Identity, LinkEvent, MeshConfig,
    MeshManager, NodeKey,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A running auction node
pub struct Node {
    config: NodeConfig,
    identity: Identity,
    endpoint: String,
    mesh: Arc<MeshManager>,
    machine: Arc<AuctionStateMachine>,
    directory: DirectoryClient,
    /// Highest registry snapshot version applied
    last_version: AtomicU64,
    shutdown: CancellationToken,
}

impl Node {
    /// Start a node: load the identity, listen for links, join the directory
    pub async fn start(config: NodeConfig, stores: Stores) -> NodeResult<Arc<Self>> {
        let key = Arc::new(NodeKey::load_or_generate(stores.meta.as_ref())?);
        let identity = key.identity().clone();
        info!(identity = %identity, "Starting bidmesh node");

        let dispatcher = Arc::new(Dispatcher::new());
        let mesh_config = MeshConfig {
            request_timeout: config.request_timeout,
            handshake_timeout: config.request_timeout,
        };
        let (mesh, link_events) = MeshManager::new(key, dispatcher.clone(), mesh_config);

        let broadcaster: Arc<dyn Broadcaster> = mesh.clone();
        let machine = Arc::new(AuctionStateMachine::new(
            identity.clone(),
            stores.auctions,
            broadcaster,
            config.policy,
        ));
        machine.recover().await?;
        register_operations(&dispatcher, &machine);

        let bound = mesh.listen(&config.listen).await?;
        let endpoint = config
            .advertise
            .clone()
            .unwrap_or_else(|| advertised_endpoint(bound));

        let (directory_tx, directory_events) = mpsc::channel(64);
        let directory = DirectoryClient::connect(&config.directory, directory_tx).await?;
        directory.announce(&identity, Some(endpoint.clone())).await?;
        info!(endpoint = %endpoint, policy = %config.policy, "Announced to directory");

        let node = Arc::new(Self {
            config,
            identity,
            endpoint,
            mesh,
            machine,
            directory,
            last_version: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(node.clone().run(link_events, directory_events));
        Ok(node)
    }

    async fn run(
        self: Arc<Self>,
        mut link_events: mpsc::Receiver<LinkEvent>,
        mut directory_events: mpsc::Receiver<DirectoryEvent>,
    ) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(event) = link_events.recv() => self.on_link_event(event).await,
                Some(event) = directory_events.recv() => self.on_directory_event(event),
                else => break,
            }
        }
        debug!("Node event loop stopped");
    }

    async fn on_link_event(&self, event: LinkEvent) {
        let LinkEvent::Closed { identity, link_id } = event;
        if let Some(reachable) = self.mesh.on_link_closed(&identity, link_id) {
            if let Err(e) = self.directory.send_updated_peer_list(reachable).await {
                warn!("Failed to send updated peer list: {}", e);
            }
        }
    }

    fn on_directory_event(&self, event: DirectoryEvent) {
        match event {
            DirectoryEvent::PeerList {
                identities,
                endpoints,
                version,
            } => {
                if !self.accept_version(version) {
                    debug!(version, "ignoring stale registry snapshot");
                    return;
                }
                debug!(version, peers = identities.len(), "registry snapshot");
                self.mesh.update_endpoints(&endpoints);

                // Dialing waits on handshakes; keep the event loop free
                let mesh = self.mesh.clone();
                tokio::spawn(async move {
                    mesh.on_peer_list_received(&identities).await;
                });
            }
            DirectoryEvent::Disconnected => {
                warn!("Directory session lost; existing links stay up");
                self.last_version.store(0, Ordering::SeqCst);
            }
        }
    }

    /// Snapshots without a version are always applied
    fn accept_version(&self, version: u64) -> bool {
        if version == 0 {
            return true;
        }
        self.last_version.fetch_max(version, Ordering::SeqCst) < version
    }

    /// Own identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Mesh address announced to the directory
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Node configuration
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The node's link set
    pub fn mesh(&self) -> &Arc<MeshManager> {
        &self.mesh
    }

    /// The node's auction state
    pub fn machine(&self) -> &Arc<AuctionStateMachine> {
        &self.machine
    }

    /// Announce this node to the directory again
    pub async fn announce(&self) -> NodeResult<()> {
        self.directory
            .announce(&self.identity, Some(self.endpoint.clone()))
            .await
            .map_err(NodeError::from)
    }

    /// Open an auction
    pub async fn open(&self, item: &str, price: f64) -> NodeResult<OpenOutcome> {
        Ok(self.machine.open_local(item, price).await?)
    }

    /// Bid on an open auction
    pub async fn bid(&self, item: &str, price: f64) -> NodeResult<BidOutcome> {
        Ok(self.machine.bid_local(item, price).await?)
    }

    /// Close this node's auction
    pub async fn close(&self, item: &str) -> NodeResult<CloseOutcome> {
        Ok(self.machine.close_local(item).await?)
    }

    /// Linked peers
    pub fn peers(&self) -> Vec<Identity> {
        self.mesh.linked_peers()
    }

    /// Local record for `item`
    pub fn show(&self, item: &str) -> NodeResult<Option<AuctionRecord>> {
        Ok(self.machine.show(item)?)
    }

    /// Notices about peer activity
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.machine.subscribe()
    }

    /// Check if node is running
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Leave the mesh and the directory
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down node");
        self.shutdown.cancel();
        self.mesh.shutdown();
        self.directory.close();
    }
}

/// Address peers can dial: an unspecified bind address becomes loopback
pub fn advertised_endpoint(bound: SocketAddr) -> String {
    if bound.ip().is_unspecified() {
        let loopback = match bound {
            SocketAddr::V4(_) => std::net::IpAddr::from([127, 0, 0, 1]),
            SocketAddr::V6(_) => std::net::IpAddr::from(std::net::Ipv6Addr::LOCALHOST),
        };
        SocketAddr::new(loopback, bound.port()).to_string()
    } else {
        bound.to_string()
    }
}
