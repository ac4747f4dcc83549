//! Authenticated mesh links between two nodes

use crate::codec::{encode_json, FrameCodec};
use crate::dispatch::{Dispatcher, HandlerResult, RequestContext};
use crate::error::{NetworkError, NetworkResult};
use crate::identity::{verify, Identity, NodeKey};
use crate::message::{proof_message, LinkFrame};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type FramedLink = Framed<TcpStream, FrameCodec>;
type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<HandlerResult>>>>;

/// Outbound frame queue depth per link
const OUTBOUND_QUEUE: usize = 256;

/// Lifecycle notifications emitted by links
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link to `identity` with id `link_id` is gone
    Closed {
        /// Remote identity
        identity: Identity,
        /// Link instance that closed
        link_id: u64,
    },
}

/// Everything a link needs besides its socket
#[derive(Clone)]
pub struct LinkContext {
    /// Local signing key
    pub key: Arc<NodeKey>,
    /// Handlers for incoming requests
    pub dispatcher: Arc<Dispatcher>,
    /// Where close notifications go
    pub events: mpsc::Sender<LinkEvent>,
    /// Upper bound on the handshake
    pub handshake_timeout: Duration,
    link_ids: Arc<AtomicU64>,
}

impl LinkContext {
    /// Create a context
    pub fn new(
        key: Arc<NodeKey>,
        dispatcher: Arc<Dispatcher>,
        events: mpsc::Sender<LinkEvent>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            key,
            dispatcher,
            events,
            handshake_timeout,
            link_ids: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// One established link to a remote node
pub struct PeerLink {
    identity: Identity,
    local: Identity,
    link_id: u64,
    inbound: bool,
    outbound: mpsc::Sender<LinkFrame>,
    pending: PendingCalls,
    next_request: AtomicU64,
    cancel: CancellationToken,
}

impl PeerLink {
    /// Authenticated identity of the remote side
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Unique id of this link instance
    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Whether the remote side dialed us
    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    /// Whether the link is still running
    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Invoke `op` on the remote side and wait for its result
    pub async fn call(&self, op: &str, payload: Value, timeout: Duration) -> NetworkResult<Value> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = LinkFrame::Request {
            id,
            op: op.to_string(),
            caller: self.local.clone(),
            payload,
        };

        let exchange = async {
            self.outbound
                .send(frame)
                .await
                .map_err(|_| NetworkError::ChannelClosed)?;
            match rx.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => Err(NetworkError::Remote(error)),
                Err(_) => Err(NetworkError::ChannelClosed),
            }
        };

        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout(format!(
                "{} to {} after {:?}",
                op,
                self.identity.short(),
                timeout
            ))),
        };
        if result.is_err() {
            self.pending.lock().remove(&id);
        }
        result
    }

    /// Shut the link down; a close event follows
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("identity", &self.identity)
            .field("link_id", &self.link_id)
            .field("inbound", &self.inbound)
            .finish()
    }
}

/// Dial `endpoint` and authenticate the remote node
pub async fn connect(
    endpoint: &str,
    expected: Option<&Identity>,
    ctx: &LinkContext,
) -> NetworkResult<Arc<PeerLink>> {
    let stream = tokio::time::timeout(ctx.handshake_timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| NetworkError::Timeout(format!("connecting to {}", endpoint)))?
        .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", endpoint, e)))?;
    establish(stream, expected, false, ctx).await
}

/// Authenticate a node that dialed us
pub async fn accept(stream: TcpStream, ctx: &LinkContext) -> NetworkResult<Arc<PeerLink>> {
    establish(stream, None, true, ctx).await
}

async fn establish(
    stream: TcpStream,
    expected: Option<&Identity>,
    inbound: bool,
    ctx: &LinkContext,
) -> NetworkResult<Arc<PeerLink>> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    let peer = tokio::time::timeout(
        ctx.handshake_timeout,
        handshake(&mut framed, &ctx.key, expected),
    )
    .await
    .map_err(|_| NetworkError::Timeout("link handshake".into()))??;

    let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let link = Arc::new(PeerLink {
        identity: peer.clone(),
        local: ctx.key.identity().clone(),
        link_id: ctx.link_ids.fetch_add(1, Ordering::Relaxed),
        inbound,
        outbound: outbound.clone(),
        pending: Arc::new(Mutex::new(HashMap::new())),
        next_request: AtomicU64::new(1),
        cancel: CancellationToken::new(),
    });

    info!(
        peer = %peer.short(),
        link_id = link.link_id,
        inbound,
        "mesh link established"
    );

    let (sink, stream) = framed.split();
    let task = LinkTask {
        identity: peer,
        link_id: link.link_id,
        pending: link.pending.clone(),
        cancel: link.cancel.clone(),
        responder: outbound,
        dispatcher: ctx.dispatcher.clone(),
        events: ctx.events.clone(),
    };
    tokio::spawn(task.run(sink, stream, rx));

    Ok(link)
}

async fn send_frame(framed: &mut FramedLink, frame: &LinkFrame) -> NetworkResult<()> {
    framed.send(encode_json(frame)?).await
}

async fn next_frame(framed: &mut FramedLink) -> NetworkResult<LinkFrame> {
    match framed.next().await {
        Some(raw) => LinkFrame::decode(&raw?),
        None => Err(NetworkError::HandshakeFailed(
            "connection closed during handshake".into(),
        )),
    }
}

/// Mutual challenge-response: each side signs the other's nonce
async fn handshake(
    framed: &mut FramedLink,
    key: &NodeKey,
    expected: Option<&Identity>,
) -> NetworkResult<Identity> {
    let nonce = hex::encode(rand::random::<[u8; 16]>());
    send_frame(
        framed,
        &LinkFrame::Hello {
            identity: key.identity().clone(),
            nonce: nonce.clone(),
        },
    )
    .await?;

    let (peer, peer_nonce) = match next_frame(framed).await? {
        LinkFrame::Hello { identity, nonce } => (identity, nonce),
        other => {
            return Err(NetworkError::HandshakeFailed(format!(
                "expected hello, got {:?}",
                other
            )))
        }
    };

    if &peer == key.identity() {
        return Err(NetworkError::HandshakeFailed("connected to self".into()));
    }
    if let Some(expected) = expected {
        if expected != &peer {
            return Err(NetworkError::IdentityMismatch {
                expected: expected.to_string(),
                actual: peer.to_string(),
            });
        }
    }

    let signature = key.sign(&proof_message(&peer_nonce, key.identity()));
    send_frame(framed, &LinkFrame::Proof { signature }).await?;

    match next_frame(framed).await? {
        LinkFrame::Proof { signature } => {
            verify(&peer, &proof_message(&nonce, &peer), &signature)
                .map_err(|e| NetworkError::HandshakeFailed(format!("bad proof: {}", e)))?;
        }
        other => {
            return Err(NetworkError::HandshakeFailed(format!(
                "expected proof, got {:?}",
                other
            )))
        }
    }

    Ok(peer)
}

struct LinkTask {
    identity: Identity,
    link_id: u64,
    pending: PendingCalls,
    cancel: CancellationToken,
    responder: mpsc::Sender<LinkFrame>,
    dispatcher: Arc<Dispatcher>,
    events: mpsc::Sender<LinkEvent>,
}

impl LinkTask {
    async fn run(
        self,
        mut sink: SplitSink<FramedLink, Bytes>,
        mut stream: SplitStream<FramedLink>,
        mut rx: mpsc::Receiver<LinkFrame>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(peer = %self.identity.short(), link_id = self.link_id, "link closed locally");
                    break;
                }
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let sent = match encode_json(&frame) {
                        Ok(bytes) => sink.send(bytes).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        warn!(peer = %self.identity.short(), "link write failed: {}", e);
                        break;
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(raw)) => self.handle_incoming(&raw),
                    Some(Err(e)) => {
                        warn!(peer = %self.identity.short(), "link read failed: {}", e);
                        break;
                    }
                    None => {
                        debug!(peer = %self.identity.short(), link_id = self.link_id, "link closed by peer");
                        break;
                    }
                },
            }
        }

        self.cancel.cancel();
        // Dropping the senders fails every outstanding call
        self.pending.lock().clear();
        let _ = sink.close().await;

        let _ = self
            .events
            .send(LinkEvent::Closed {
                identity: self.identity.clone(),
                link_id: self.link_id,
            })
            .await;
    }

    fn handle_incoming(&self, raw: &[u8]) {
        let frame = match LinkFrame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %self.identity.short(), "ignoring link frame: {}", e);
                return;
            }
        };

        match frame {
            LinkFrame::Request {
                id,
                op,
                caller,
                payload,
            } => {
                let ctx = RequestContext {
                    peer: self.identity.clone(),
                    caller,
                };
                let dispatcher = self.dispatcher.clone();
                let responder = self.responder.clone();
                // Requests run concurrently so a slow handler cannot block replies
                tokio::spawn(async move {
                    let reply = match dispatcher.dispatch(ctx, &op, payload).await {
                        Ok(value) => LinkFrame::ok(id, value),
                        Err(error) => LinkFrame::err(id, error),
                    };
                    let _ = responder.send(reply).await;
                });
            }
            LinkFrame::Response {
                id,
                ok,
                value,
                error,
            } => {
                let waiter = self.pending.lock().remove(&id);
                match waiter {
                    Some(tx) => {
                        let result = if ok {
                            Ok(value)
                        } else {
                            Err(error.unwrap_or_else(|| "unspecified error".into()))
                        };
                        let _ = tx.send(result);
                    }
                    None => debug!(peer = %self.identity.short(), id, "late response dropped"),
                }
            }
            LinkFrame::Hello { .. } | LinkFrame::Proof { .. } => {
                warn!(peer = %self.identity.short(), "unexpected handshake frame on open link");
            }
        }
    }
}
