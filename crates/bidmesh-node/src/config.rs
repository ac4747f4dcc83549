//! Configuration types for bidmesh

use crate::cli::{Cli, DirectoryArgs, NodeArgs};
use crate::error::{NodeError, NodeResult};
use bidmesh_auction::ValidationPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default directory address
pub const DEFAULT_DIRECTORY_ADDR: &str = "127.0.0.1:4000";

/// Default mesh listen address (any free port)
pub const DEFAULT_MESH_ADDR: &str = "127.0.0.1:0";

/// Default data directory
pub const DEFAULT_DATADIR: &str = "./data";

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Auction node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Database directory; `None` keeps everything in memory
    pub datadir: Option<PathBuf>,
    /// Mesh listen address
    pub listen: String,
    /// Mesh address announced to the directory, if not the bound one
    pub advertise: Option<String>,
    /// Directory address
    pub directory: String,
    /// Bound on each remote operation
    pub request_timeout: Duration,
    /// Receiver-side validation
    pub policy: ValidationPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            datadir: None,
            listen: DEFAULT_MESH_ADDR.to_string(),
            advertise: None,
            directory: DEFAULT_DIRECTORY_ADDR.to_string(),
            request_timeout: Duration::from_millis(default_request_timeout_ms()),
            policy: ValidationPolicy::default(),
        }
    }
}

impl NodeConfig {
    /// Merge CLI flags over file values over defaults
    pub fn resolve(cli: &Cli, args: &NodeArgs, file: &FileConfig) -> Self {
        let section = &file.node;
        let datadir = match cli.datadir.clone().or_else(|| file.datadir.clone()) {
            Some(dir) => dir.join("node"),
            // Unconfigured nodes on one host must not share a RocksDB lock
            None => {
                PathBuf::from(DEFAULT_DATADIR).join(format!("node-{:08x}", rand::random::<u32>()))
            }
        };
        Self {
            datadir: Some(datadir),
            listen: args
                .listen
                .clone()
                .or_else(|| section.listen.clone())
                .unwrap_or_else(|| DEFAULT_MESH_ADDR.to_string()),
            advertise: args.advertise.clone().or_else(|| section.advertise.clone()),
            directory: args
                .directory
                .clone()
                .or_else(|| section.directory.clone())
                .unwrap_or_else(|| DEFAULT_DIRECTORY_ADDR.to_string()),
            request_timeout: Duration::from_millis(
                args.request_timeout_ms
                    .unwrap_or(section.request_timeout_ms),
            ),
            policy: args.policy.unwrap_or(section.policy),
        }
    }
}

/// Directory configuration
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Database directory; `None` keeps everything in memory
    pub datadir: Option<PathBuf>,
    /// Listen address for node sessions
    pub listen: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            datadir: None,
            listen: DEFAULT_DIRECTORY_ADDR.to_string(),
        }
    }
}

impl DirectoryConfig {
    /// Merge CLI flags over file values over defaults
    pub fn resolve(cli: &Cli, args: &DirectoryArgs, file: &FileConfig) -> Self {
        let datadir = cli
            .datadir
            .clone()
            .or_else(|| file.datadir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATADIR));
        Self {
            datadir: Some(datadir.join("directory")),
            listen: args
                .listen
                .clone()
                .or_else(|| file.directory.listen.clone())
                .unwrap_or_else(|| DEFAULT_DIRECTORY_ADDR.to_string()),
        }
    }
}

/// Optional TOML config file
///
/// ```toml
/// datadir = "./data"
/// log_level = "info"
///
/// [directory]
/// listen = "0.0.0.0:4000"
///
/// [node]
/// listen = "0.0.0.0:5000"
/// directory = "10.0.0.1:4000"
/// request_timeout_ms = 5000
/// policy = "strict"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Data directory
    pub datadir: Option<PathBuf>,
    /// Log level
    pub log_level: Option<String>,
    /// Directory section
    pub directory: DirectorySection,
    /// Node section
    pub node: NodeSection,
}

/// `[directory]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySection {
    /// Listen address
    pub listen: Option<String>,
}

/// `[node]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Mesh listen address
    #[serde(default)]
    pub listen: Option<String>,
    /// Announced mesh address
    #[serde(default)]
    pub advertise: Option<String>,
    /// Directory address
    #[serde(default)]
    pub directory: Option<String>,
    /// Remote operation timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Validation policy
    #[serde(default)]
    pub policy: ValidationPolicy,
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            listen: None,
            advertise: None,
            directory: None,
            request_timeout_ms: default_request_timeout_ms(),
            policy: ValidationPolicy::default(),
        }
    }
}

impl FileConfig {
    /// Load a config file
    pub fn load(path: &Path) -> NodeResult<Self> {
        tracing::info!("Loading config from {:?}", path);
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse config file contents
    pub fn parse(content: &str) -> NodeResult<Self> {
        toml::from_str(content).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Log level from the file, CLI or default
    pub fn log_level(&self, cli: &Cli) -> String {
        cli.log_level
            .clone()
            .or_else(|| self.log_level.clone())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Command;
    use clap::Parser;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn node_args(cli: &Cli) -> NodeArgs {
        match &cli.command {
            Command::Node(args) => args.clone(),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_defaults_without_file() {
        let cli = Cli::parse_from(["bidmesh", "node"]);
        let config = NodeConfig::resolve(&cli, &node_args(&cli), &FileConfig::default());

        let datadir = config.datadir.clone().unwrap();
        assert_eq!(datadir.parent(), Some(Path::new(DEFAULT_DATADIR)));
        assert!(datadir
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("node-")));
        assert_eq!(config.listen, DEFAULT_MESH_ADDR);
        assert_eq!(config.directory, DEFAULT_DIRECTORY_ADDR);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.policy, ValidationPolicy::Strict);
        assert_eq!(FileConfig::default().log_level(&cli), "info");
    }

    #[test]
    fn test_unconfigured_nodes_get_separate_datadirs() {
        let cli = Cli::parse_from(["bidmesh", "node"]);
        let args = node_args(&cli);
        let first = NodeConfig::resolve(&cli, &args, &FileConfig::default());
        let second = NodeConfig::resolve(&cli, &args, &FileConfig::default());
        assert_ne!(first.datadir, second.datadir);

        let cli = Cli::parse_from(["bidmesh", "--datadir", "/tmp/a", "node"]);
        let config = NodeConfig::resolve(&cli, &node_args(&cli), &FileConfig::default());
        assert_eq!(config.datadir, Some(PathBuf::from("/tmp/a/node")));
    }

    #[test]
    fn test_file_values_used() {
        let file = FileConfig::parse(
            r#"
            datadir = "/var/lib/bidmesh"
            log_level = "debug"

            [directory]
            listen = "0.0.0.0:4100"

            [node]
            directory = "10.0.0.1:4100"
            request_timeout_ms = 1500
            policy = "trusting"
            "#,
        )
        .unwrap();

        let cli = Cli::parse_from(["bidmesh", "node"]);
        let config = NodeConfig::resolve(&cli, &node_args(&cli), &file);
        assert_eq!(config.datadir, Some(PathBuf::from("/var/lib/bidmesh/node")));
        assert_eq!(config.directory, "10.0.0.1:4100");
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.policy, ValidationPolicy::Trusting);
        assert_eq!(file.log_level(&cli), "debug");

        let cli = Cli::parse_from(["bidmesh", "directory"]);
        let args = match &cli.command {
            Command::Directory(args) => args.clone(),
            other => panic!("unexpected command {:?}", other),
        };
        let directory = DirectoryConfig::resolve(&cli, &args, &file);
        assert_eq!(directory.listen, "0.0.0.0:4100");
        assert_eq!(directory.datadir, Some(PathBuf::from("/var/lib/bidmesh/directory")));
    }

    #[test]
    fn test_flags_override_file() {
        let file = FileConfig::parse(
            r#"
            [node]
            directory = "10.0.0.1:4100"
            policy = "trusting"
            "#,
        )
        .unwrap();

        let cli = Cli::parse_from([
            "bidmesh",
            "node",
            "--directory",
            "127.0.0.1:4200",
            "--policy",
            "strict",
            "--log-level",
            "warn",
        ]);
        let config = NodeConfig::resolve(&cli, &node_args(&cli), &file);
        assert_eq!(config.directory, "127.0.0.1:4200");
        assert_eq!(config.policy, ValidationPolicy::Strict);
        assert_eq!(file.log_level(&cli), "warn");
    }

    #[test]
    fn test_load_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[node]\nlisten = \"127.0.0.1:5005\"\n").unwrap();

        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(config.node.listen.as_deref(), Some("127.0.0.1:5005"));
        assert_eq!(config.node.request_timeout_ms, 5_000);
    }

    #[test]
    fn test_invalid_file_rejected() {
        assert!(matches!(
            FileConfig::parse("[node]\npolicy = \"paranoid\""),
            Err(NodeError::Config(_))
        ));
    }
}
