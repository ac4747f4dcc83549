//! # bidmesh-network
//!
//! Rendezvous and peer-to-peer mesh for bidmesh.
//!
//! This crate provides:
//! - Persistent node identities backed by secp256k1 keys
//! - The directory server and the node-side directory session
//! - Authenticated mesh links carrying named request/response operations
//! - Full-mesh formation and best-effort broadcast
//!
//! ## Architecture
//!
//! ```text
//! +-------------------+        +-------------------+
//! |  DirectoryServer  | <----> |  DirectoryClient  |  <- registry snapshots
//! +-------------------+        +-------------------+
//!                                       |
//!                              +-------------------+
//!                              |    MeshManager    |  <- link set
//!                              +-------------------+
//!                                       |
//!                     +-----------------+-----------------+
//!                     |  PeerLink  |  PeerLink  |  ...    |  <- framed TCP
//!                     +-----------------+-----------------+
//!                                       |
//!                              +-------------------+
//!                              |    Dispatcher     |  <- op name -> handler
//!                              +-------------------+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use bidmesh_network::{Dispatcher, MeshConfig, MeshManager, NodeKey};
//!
//! let key = Arc::new(NodeKey::load_or_generate(&store)?);
//! let dispatcher = Arc::new(Dispatcher::new());
//! let (mesh, mut link_events) = MeshManager::new(key, dispatcher, MeshConfig::default());
//! let addr = mesh.listen("127.0.0.1:0").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broadcast;
pub mod codec;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod link;
pub mod mesh;
pub mod message;
pub mod session;

pub use broadcast::{fan_out, BroadcastReport, Broadcaster};
pub use codec::{encode_json, FrameCodec, MAX_FRAME_SIZE};
pub use directory::{DirectoryServer, SessionId, REGISTRY_KEY};
pub use dispatch::{Dispatcher, Handler, HandlerResult, RequestContext};
pub use error::{NetworkError, NetworkResult};
pub use identity::{verify, Identity, NodeKey, SEED_KEY};
pub use link::{LinkContext, LinkEvent, PeerLink};
pub use mesh::{MeshConfig, MeshManager};
pub use message::{DirectoryMessage, LinkFrame};
pub use session::{DirectoryClient, DirectoryEvent};
