//! Rendezvous server keeping the registry of known identities

use crate::codec::{encode_json, FrameCodec};
use crate::error::{NetworkError, NetworkResult};
use crate::identity::Identity;
use crate::message::DirectoryMessage;
use bidmesh_storage::{KeyValueStore, KeyValueStoreExt};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Store key holding the registry
pub const REGISTRY_KEY: &str = "public-keys";

/// Outbound queue depth per directory session
const SESSION_QUEUE: usize = 64;

/// Handle of one connected node session
pub type SessionId = u64;

struct Session {
    tx: mpsc::Sender<Bytes>,
    /// Ends the session's serve loop, closing its socket
    closed: CancellationToken,
}

/// The directory: an insertion-ordered, de-duplicated registry of
/// identities, pushed in full to every session whenever it changes.
pub struct DirectoryServer {
    store: Arc<dyn KeyValueStore>,
    /// Serialises read-modify-write of the persisted registry
    registry: Mutex<Vec<Identity>>,
    sessions: RwLock<HashMap<SessionId, Session>>,
    endpoints: RwLock<BTreeMap<Identity, String>>,
    version: AtomicU64,
    next_session: AtomicU64,
    cancel: CancellationToken,
}

impl DirectoryServer {
    /// Create a directory over `store`, clearing any previous registry
    pub fn new(store: Arc<dyn KeyValueStore>) -> NetworkResult<Arc<Self>> {
        store.delete(REGISTRY_KEY)?;
        Ok(Arc::new(Self {
            store,
            registry: Mutex::new(Vec::new()),
            sessions: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            next_session: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        }))
    }

    /// Accept node sessions on `addr`; returns the bound address
    pub async fn bind(self: &Arc<Self>, addr: &str) -> NetworkResult<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!("Directory listening on {}", local);

        let server = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = server.cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            debug!("Directory session from {}", remote);
                            tokio::spawn(server.clone().serve(stream, remote));
                        }
                        Err(e) => error!("Directory accept error: {}", e),
                    },
                }
            }
            debug!("Directory accept loop stopped");
        });

        Ok(local)
    }

    async fn serve(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let (mut sink, mut frames) = Framed::new(stream, FrameCodec::new()).split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(SESSION_QUEUE);
        let closed = self.cancel.child_token();
        let session = self.insert_session(tx, closed.clone());

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    debug!("Directory write to {} failed: {}", remote, e);
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(Ok(raw)) => {
                        if let Err(e) = self.on_message(session, &raw) {
                            error!(session, "Directory failed to apply message: {}", e);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(session, "Directory read from {} failed: {}", remote, e);
                        break;
                    }
                    None => break,
                },
            }
        }

        self.on_session_closed(session);
        writer.abort();
    }

    /// Track a new inbound session whose frames are written through `tx`
    pub fn on_session_established(&self, tx: mpsc::Sender<Bytes>) -> SessionId {
        self.insert_session(tx, self.cancel.child_token())
    }

    fn insert_session(&self, tx: mpsc::Sender<Bytes>, closed: CancellationToken) -> SessionId {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions.write().insert(id, Session { tx, closed });
        debug!(session = id, "directory session established");
        id
    }

    /// Forget a session
    pub fn on_session_closed(&self, session: SessionId) {
        if let Some(entry) = self.sessions.write().remove(&session) {
            entry.closed.cancel();
            debug!(session, "directory session closed");
        }
    }

    #[cfg(test)]
    fn session_token(&self, session: SessionId) -> Option<CancellationToken> {
        self.sessions.read().get(&session).map(|s| s.closed.clone())
    }

    /// Number of active sessions
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Apply one raw frame received on `session`.
    ///
    /// Unknown or malformed records are logged and ignored; only storage
    /// failures are returned.
    pub fn on_message(&self, session: SessionId, raw: &[u8]) -> NetworkResult<()> {
        let msg = match DirectoryMessage::decode(raw) {
            Ok(msg) => msg,
            Err(NetworkError::UnknownDiscriminant(mode)) => {
                warn!(session, mode = %mode, "ignoring directory message with unknown mode");
                return Ok(());
            }
            Err(e) => {
                warn!(session, "ignoring malformed directory message: {}", e);
                return Ok(());
            }
        };

        match msg {
            DirectoryMessage::NewPeer { identity, endpoint } => {
                self.handle_new_peer(identity, endpoint)
            }
            DirectoryMessage::UpdatedPeerList { identities } => {
                self.handle_updated_peer_list(session, identities)
            }
            DirectoryMessage::PublicKeys { .. } => {
                warn!(session, "ignoring public-keys sent to the directory");
                Ok(())
            }
        }
    }

    fn handle_new_peer(&self, identity: Identity, endpoint: Option<String>) -> NetworkResult<()> {
        if let Some(endpoint) = endpoint {
            self.endpoints.write().insert(identity.clone(), endpoint);
        }

        let snapshot = {
            let mut registry = self.registry.lock();
            if registry.contains(&identity) {
                debug!(peer = %identity.short(), "peer re-announced");
            } else {
                let mut next = registry.clone();
                next.push(identity.clone());
                self.store.put_json(REGISTRY_KEY, &next)?;
                *registry = next;
                info!(peer = %identity.short(), peers = registry.len(), "peer registered");
            }
            self.snapshot(&registry)
        };

        // A repeated announcement still gets the list out to a reconnecting node
        self.broadcast(&snapshot);
        Ok(())
    }

    fn handle_updated_peer_list(
        &self,
        session: SessionId,
        identities: Vec<Identity>,
    ) -> NetworkResult<()> {
        let snapshot = {
            let mut registry = self.registry.lock();
            let next = dedup(identities);
            self.store.put_json(REGISTRY_KEY, &next)?;
            info!(
                session,
                before = registry.len(),
                after = next.len(),
                "registry replaced by updated peer list"
            );
            *registry = next;
            self.snapshot(&registry)
        };

        self.broadcast(&snapshot);
        Ok(())
    }

    fn snapshot(&self, registry: &[Identity]) -> DirectoryMessage {
        let endpoints = self.endpoints.read();
        let endpoints = registry
            .iter()
            .filter_map(|id| endpoints.get(id).map(|ep| (id.clone(), ep.clone())))
            .collect();
        DirectoryMessage::PublicKeys {
            identities: registry.to_vec(),
            endpoints,
            version: self.version.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    /// Current registry, as persisted
    pub fn registry(&self) -> NetworkResult<Vec<Identity>> {
        Ok(self
            .store
            .get_json::<Vec<Identity>>(REGISTRY_KEY)?
            .unwrap_or_default())
    }

    /// Write `msg` to every session; returns how many accepted it.
    ///
    /// A session that cannot take the frame is dropped without affecting
    /// delivery to the others. A session whose queue is full is also
    /// disconnected, so its node sees the session end instead of silently
    /// missing every later snapshot.
    pub fn broadcast(&self, msg: &DirectoryMessage) -> usize {
        let frame = match encode_json(msg) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode {}: {}", msg.mode(), e);
                return 0;
            }
        };

        let mut dead = Vec::new();
        let mut delivered = 0;
        for (id, session) in self.sessions.read().iter() {
            match session.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(session = *id, "directory session is not keeping up, disconnecting");
                    dead.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session = *id, "dropping closed directory session");
                    dead.push(*id);
                }
            }
        }

        if !dead.is_empty() {
            let mut sessions = self.sessions.write();
            for id in dead {
                if let Some(session) = sessions.remove(&id) {
                    session.closed.cancel();
                }
            }
        }

        debug!(mode = msg.mode(), delivered, "directory broadcast");
        delivered
    }

    /// Stop accepting and close all sessions
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for (_, session) in self.sessions.write().drain() {
            session.closed.cancel();
        }
    }
}

fn dedup(identities: Vec<Identity>) -> Vec<Identity> {
    let mut out: Vec<Identity> = Vec::with_capacity(identities.len());
    for id in identities {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidmesh_storage::MemoryStore;

    fn server() -> (Arc<DirectoryServer>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (DirectoryServer::new(store.clone()).unwrap(), store)
    }

    fn decode(frame: Bytes) -> DirectoryMessage {
        DirectoryMessage::decode(&frame).unwrap()
    }

    fn ids(msg: &DirectoryMessage) -> Vec<&str> {
        match msg {
            DirectoryMessage::PublicKeys { identities, .. } => {
                identities.iter().map(|id| id.as_str()).collect()
            }
            other => panic!("expected public-keys, got {:?}", other),
        }
    }

    fn new_peer(id: &str) -> Vec<u8> {
        serde_json::to_vec(&DirectoryMessage::NewPeer {
            identity: Identity::new(id),
            endpoint: Some(format!("127.0.0.1:{}", id.len())),
        })
        .unwrap()
    }

    #[test]
    fn test_new_clears_registry() {
        let store = Arc::new(MemoryStore::new());
        store.put_json(REGISTRY_KEY, &vec!["stale"]).unwrap();
        let server = DirectoryServer::new(store.clone()).unwrap();
        assert!(server.registry().unwrap().is_empty());
    }

    #[test]
    fn test_new_peer_appends_and_broadcasts() {
        let (server, _store) = server();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let s1 = server.on_session_established(tx1);
        server.on_session_established(tx2);

        server.on_message(s1, &new_peer("aa")).unwrap();
        server.on_message(s1, &new_peer("bb")).unwrap();

        assert_eq!(
            server.registry().unwrap(),
            vec![Identity::new("aa"), Identity::new("bb")]
        );
        assert_eq!(ids(&decode(rx1.try_recv().unwrap())), vec!["aa"]);
        assert_eq!(ids(&decode(rx1.try_recv().unwrap())), vec!["aa", "bb"]);
        assert_eq!(ids(&decode(rx2.try_recv().unwrap())), vec!["aa"]);
        assert_eq!(ids(&decode(rx2.try_recv().unwrap())), vec!["aa", "bb"]);
    }

    #[test]
    fn test_repeated_announcement_deduplicated_but_broadcast() {
        let (server, _store) = server();
        let (tx, mut rx) = mpsc::channel(8);
        let s = server.on_session_established(tx);

        server.on_message(s, &new_peer("aa")).unwrap();
        server.on_message(s, &new_peer("aa")).unwrap();

        assert_eq!(server.registry().unwrap().len(), 1);
        let first = decode(rx.try_recv().unwrap());
        let second = decode(rx.try_recv().unwrap());
        assert_eq!(ids(&second), vec!["aa"]);

        // Versions keep increasing even when the content is unchanged
        match (first, second) {
            (
                DirectoryMessage::PublicKeys { version: v1, .. },
                DirectoryMessage::PublicKeys { version: v2, endpoints, .. },
            ) => {
                assert!(v2 > v1);
                assert_eq!(endpoints.get(&Identity::new("aa")).unwrap(), "127.0.0.1:2");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_updated_peer_list_overwrites() {
        let (server, _store) = server();
        let (tx, mut rx) = mpsc::channel(8);
        let s = server.on_session_established(tx);
        for id in ["aa", "bb", "cc"] {
            server.on_message(s, &new_peer(id)).unwrap();
        }

        let update = serde_json::to_vec(&DirectoryMessage::UpdatedPeerList {
            identities: vec![Identity::new("cc"), Identity::new("aa"), Identity::new("cc")],
        })
        .unwrap();
        server.on_message(s, &update).unwrap();

        assert_eq!(
            server.registry().unwrap(),
            vec![Identity::new("cc"), Identity::new("aa")]
        );
        let last = std::iter::from_fn(|| rx.try_recv().ok()).last().unwrap();
        assert_eq!(ids(&decode(last)), vec!["cc", "aa"]);
    }

    #[test]
    fn test_unknown_mode_ignored() {
        let (server, _store) = server();
        let (tx, mut rx) = mpsc::channel(8);
        let s = server.on_session_established(tx);
        server.on_message(s, &new_peer("aa")).unwrap();
        let _ = rx.try_recv();

        server.on_message(s, br#"{"mode":"ping-all"}"#).unwrap();
        server.on_message(s, b"garbage").unwrap();

        assert_eq!(server.registry().unwrap(), vec![Identity::new("aa")]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_drops_dead_session() {
        let (server, _store) = server();
        let (tx_live, mut rx_live) = mpsc::channel(8);
        let (tx_dead, rx_dead) = mpsc::channel(8);
        server.on_session_established(tx_live);
        server.on_session_established(tx_dead);
        drop(rx_dead);

        let msg = DirectoryMessage::PublicKeys {
            identities: vec![Identity::new("aa")],
            endpoints: BTreeMap::new(),
            version: 1,
        };
        assert_eq!(server.broadcast(&msg), 1);
        assert_eq!(server.session_count(), 1);
        assert!(rx_live.try_recv().is_ok());
    }

    #[test]
    fn test_lagging_session_disconnected() {
        let (server, _store) = server();
        let (tx_slow, mut rx_slow) = mpsc::channel(1);
        let (tx_fast, mut rx_fast) = mpsc::channel(8);
        let slow = server.on_session_established(tx_slow);
        let fast = server.on_session_established(tx_fast);
        let slow_closed = server.session_token(slow).unwrap();

        server.on_message(fast, &new_peer("aa")).unwrap();
        assert_eq!(server.session_count(), 2);
        assert!(!slow_closed.is_cancelled());

        // Second snapshot finds the slow queue full
        server.on_message(fast, &new_peer("bb")).unwrap();
        assert_eq!(server.session_count(), 1);
        assert!(slow_closed.is_cancelled());
        assert!(server.session_token(fast).is_some());

        assert_eq!(ids(&decode(rx_slow.try_recv().unwrap())), vec!["aa"]);
        assert_eq!(ids(&decode(rx_fast.try_recv().unwrap())), vec!["aa"]);
        assert_eq!(ids(&decode(rx_fast.try_recv().unwrap())), vec!["aa", "bb"]);
    }

    #[tokio::test]
    async fn test_lagging_client_sees_disconnect() {
        let (server, _store) = server();
        let addr = server.bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut frames = Framed::new(stream, FrameCodec::new());

        for _ in 0..100 {
            if server.session_count() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let session = *server.sessions.read().keys().next().unwrap();
        server.session_token(session).unwrap().cancel();

        // Socket is closed once the serve loop ends
        let end = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while let Some(Ok(_)) = frames.next().await {}
        })
        .await;
        assert!(end.is_ok());
        server.shutdown();
    }

    #[test]
    fn test_session_closed() {
        let (server, _store) = server();
        let (tx, _rx) = mpsc::channel(8);
        let s = server.on_session_established(tx);
        assert_eq!(server.session_count(), 1);
        server.on_session_closed(s);
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let out = dedup(vec![
            Identity::new("b"),
            Identity::new("a"),
            Identity::new("b"),
        ]);
        assert_eq!(out, vec![Identity::new("b"), Identity::new("a")]);
    }
}
