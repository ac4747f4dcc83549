//! bidmesh binary
//!
//! Runs either the rendezvous directory or an auction node with its console.

use anyhow::Result;
use bidmesh_node::cli::{Cli, Command};
use bidmesh_node::console::run_console;
use bidmesh_node::{run_directory, DirectoryConfig, FileConfig, Node, NodeConfig, Stores};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    // Initialize tracing; stdout belongs to the console
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(file.log_level(&cli)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match &cli.command {
        Command::Directory(args) => {
            let config = DirectoryConfig::resolve(&cli, args, &file);
            tracing::info!("bidmesh directory starting...");
            run_directory(config).await?;
        }
        Command::Node(args) => {
            let config = NodeConfig::resolve(&cli, args, &file);
            tracing::info!("bidmesh node starting...");
            run_node(config).await?;
        }
    }

    tracing::info!("bidmesh stopped");
    Ok(())
}

async fn run_node(config: NodeConfig) -> Result<()> {
    let stores = Stores::for_datadir(config.datadir.as_deref())?;
    let node = Node::start(config, stores).await?;

    // Handle Ctrl+C for graceful shutdown
    tokio::select! {
        result = run_console(node.clone()) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
    }

    node.shutdown();
    Ok(())
}
