//! Rendezvous directory role

use crate::config::DirectoryConfig;
use crate::error::NodeResult;
use crate::stores::Stores;
use bidmesh_network::{DirectoryServer, Identity, NodeKey};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// A bound, running directory
pub struct DirectoryHandle {
    server: Arc<DirectoryServer>,
    addr: SocketAddr,
    identity: Identity,
}

impl DirectoryHandle {
    /// Start the directory over `stores.registry` and bind `config.listen`
    pub async fn start(config: &DirectoryConfig, stores: Stores) -> NodeResult<Self> {
        // Nodes never check it; logged so operators can tell restarts apart
        // from a different directory on the same address.
        let identity = NodeKey::load_or_generate(stores.meta.as_ref())?
            .identity()
            .clone();

        let server = DirectoryServer::new(stores.registry)?;
        let addr = server.bind(&config.listen).await?;
        info!(addr = %addr, identity = %identity.short(), "Directory listening");

        Ok(Self {
            server,
            addr,
            identity,
        })
    }

    /// Bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Directory identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The running server
    pub fn server(&self) -> &Arc<DirectoryServer> {
        &self.server
    }

    /// Stop accepting sessions and drop the connected ones
    pub fn shutdown(&self) {
        info!("Shutting down directory");
        self.server.shutdown();
    }
}

/// Run the directory until ctrl-c
pub async fn run_directory(config: DirectoryConfig) -> NodeResult<()> {
    let stores = Stores::for_datadir(config.datadir.as_deref())?;
    let handle = DirectoryHandle::start(&config, stores).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    handle.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidmesh_network::{DirectoryClient, DirectoryEvent};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn config() -> DirectoryConfig {
        DirectoryConfig {
            datadir: None,
            listen: "127.0.0.1:0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_directory_serves_sessions() {
        let handle = DirectoryHandle::start(&config(), Stores::in_memory())
            .await
            .unwrap();
        assert_ne!(handle.addr().port(), 0);

        let (tx, mut rx) = mpsc::channel(8);
        let client = DirectoryClient::connect(&handle.addr().to_string(), tx)
            .await
            .unwrap();
        let identity = Identity::new("02aa");
        client.announce(&identity, None).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            DirectoryEvent::PeerList { identities, .. } => assert_eq!(identities, vec![identity]),
            other => panic!("unexpected event {:?}", other),
        }

        client.close();
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_directory_identity_is_stable() {
        let stores = Stores::in_memory();
        let first = DirectoryHandle::start(&config(), stores.clone()).await.unwrap();
        let identity = first.identity().clone();
        first.shutdown();

        let second = DirectoryHandle::start(&config(), stores).await.unwrap();
        assert_eq!(second.identity(), &identity);
        second.shutdown();
    }

    #[tokio::test]
    async fn test_restart_clears_registry() {
        let stores = Stores::in_memory();
        let first = DirectoryHandle::start(&config(), stores.clone()).await.unwrap();
        first
            .server()
            .on_message(0, br#"{"mode":"new-peer","identity":"02aa"}"#)
            .unwrap();
        assert_eq!(first.server().registry().unwrap().len(), 1);
        first.shutdown();

        let second = DirectoryHandle::start(&config(), stores).await.unwrap();
        assert!(second.server().registry().unwrap().is_empty());
        second.shutdown();
    }
}
