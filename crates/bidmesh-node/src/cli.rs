//! CLI argument parsing for bidmesh

use bidmesh_auction::ValidationPolicy;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// bidmesh: peer-to-peer auctions over a self-forming mesh
#[derive(Parser, Debug, Clone)]
#[command(name = "bidmesh")]
#[command(about = "Peer-to-peer auction node and rendezvous directory")]
#[command(version)]
pub struct Cli {
    /// TOML config file; flags override its values
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory for the local database. Without it each node starts
    /// in a fresh ./data/node-<random> directory, so set it to keep the
    /// node's identity and auctions across restarts
    #[arg(long, global = true)]
    pub datadir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Role to run
    #[command(subcommand)]
    pub command: Command,
}

/// Roles
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the rendezvous directory
    Directory(DirectoryArgs),
    /// Run an auction node with an interactive console
    Node(NodeArgs),
}

/// Directory options
#[derive(Args, Debug, Clone, Default)]
pub struct DirectoryArgs {
    /// Listen address for node sessions
    #[arg(long)]
    pub listen: Option<String>,
}

/// Node options
#[derive(Args, Debug, Clone, Default)]
pub struct NodeArgs {
    /// Listen address for mesh links
    #[arg(long)]
    pub listen: Option<String>,

    /// Address other nodes should dial (defaults to the bound address)
    #[arg(long)]
    pub advertise: Option<String>,

    /// Directory address
    #[arg(long)]
    pub directory: Option<String>,

    /// Timeout for each remote operation, in milliseconds
    #[arg(long)]
    pub request_timeout_ms: Option<u64>,

    /// How remote auction events are validated (strict, trusting)
    #[arg(long)]
    pub policy: Option<ValidationPolicy>,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
