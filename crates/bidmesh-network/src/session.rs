//! Node-side session with the directory

use crate::codec::{encode_json, FrameCodec};
use crate::error::{NetworkError, NetworkResult};
use crate::identity::Identity;
use crate::message::DirectoryMessage;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the directory told us
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    /// A registry snapshot arrived
    PeerList {
        /// Registered identities
        identities: Vec<Identity>,
        /// Mesh endpoints of registered identities
        endpoints: BTreeMap<Identity, String>,
        /// Snapshot version
        version: u64,
    },
    /// The directory session ended
    Disconnected,
}

/// Open session to the directory
pub struct DirectoryClient {
    addr: String,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl DirectoryClient {
    /// Connect to the directory at `addr`; snapshots are delivered to `events`
    pub async fn connect(addr: &str, events: mpsc::Sender<DirectoryEvent>) -> NetworkResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("directory {}: {}", addr, e)))?;
        info!("Connected to directory at {}", addr);

        let (mut sink, mut frames) = Framed::new(stream, FrameCodec::new()).split();
        let (outbound, mut rx) = mpsc::channel::<Bytes>(64);
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    frame = rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = sink.send(frame).await {
                            warn!("Directory write failed: {}", e);
                            break;
                        }
                    }
                    frame = frames.next() => match frame {
                        Some(Ok(raw)) => {
                            if let Some(event) = to_event(&raw) {
                                if events.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!("Directory read failed: {}", e);
                            break;
                        }
                        None => break,
                    },
                }
            }
            token.cancel();
            debug!("Directory session ended");
            let _ = events.send(DirectoryEvent::Disconnected).await;
        });

        Ok(Self {
            addr: addr.to_string(),
            outbound,
            cancel,
        })
    }

    /// Directory address
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether the session is still up
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Send a directory message
    pub async fn send(&self, msg: &DirectoryMessage) -> NetworkResult<()> {
        let frame = encode_json(msg)?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| NetworkError::ChannelClosed)
    }

    /// Announce this node
    pub async fn announce(&self, identity: &Identity, endpoint: Option<String>) -> NetworkResult<()> {
        self.send(&DirectoryMessage::NewPeer {
            identity: identity.clone(),
            endpoint,
        })
        .await
    }

    /// Replace the directory's registry with `identities`
    pub async fn send_updated_peer_list(&self, identities: Vec<Identity>) -> NetworkResult<()> {
        self.send(&DirectoryMessage::UpdatedPeerList { identities }).await
    }

    /// End the session
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

fn to_event(raw: &[u8]) -> Option<DirectoryEvent> {
    match DirectoryMessage::decode(raw) {
        Ok(DirectoryMessage::PublicKeys {
            identities,
            endpoints,
            version,
        }) => Some(DirectoryEvent::PeerList {
            identities,
            endpoints,
            version,
        }),
        Ok(other) => {
            debug!(mode = other.mode(), "ignoring directory message meant for the server");
            None
        }
        Err(e) => {
            warn!("ignoring directory message: {}", e);
            None
        }
    }
}
