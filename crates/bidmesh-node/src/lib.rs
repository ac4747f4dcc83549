//! bidmesh node library
//!
//! Wires storage, the mesh and the auction state machine into the two
//! runnable roles: the rendezvous directory and the auction node.

pub mod cli;
pub mod config;
pub mod console;
pub mod directory;
pub mod error;
pub mod node;
pub mod stores;

pub use config::{DirectoryConfig, FileConfig, NodeConfig};
pub use directory::{run_directory, DirectoryHandle};
pub use error::{NodeError, NodeResult};
pub use node::Node;
pub use stores::Stores;
