//! Three-tier settings (§6), the same precedence order and
//! `clap`-driven layering as the controller's own `ControllerConfig`:
//! built-in defaults, an optional JSON config file, then CLI
//! flags/environment variables on top.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use url::Url;

fn default_controller_url() -> Url {
    Url::parse("ws://127.0.0.1:7000/signaling").expect("valid default controller url")
}

fn default_stun_servers() -> Vec<SocketAddr> {
    vec!["127.0.0.1:3478".parse().expect("valid default stun server")]
}

fn default_rpc_socket_path() -> PathBuf {
    PathBuf::from("/run/overlay-node/control.sock")
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// The optional config-file layer; every field is optional so a
/// partial file only overrides what it mentions.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    controller_url: Option<Url>,
    stun_servers: Option<Vec<SocketAddr>>,
    rpc_socket_path: Option<PathBuf>,
    config_dir: Option<PathBuf>,
    log_filter: Option<String>,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "overlay node: tun data plane and controller-signaled peer establishment")]
struct Cli {
    /// Path to an optional JSON config file.
    #[arg(long, env = "OVERLAY_NODE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "OVERLAY_NODE_CONTROLLER_URL")]
    controller_url: Option<Url>,

    /// Repeatable; comma-separated via the environment variable.
    #[arg(long, env = "OVERLAY_NODE_STUN_SERVERS", value_delimiter = ',')]
    stun_servers: Vec<SocketAddr>,

    #[arg(long, env = "OVERLAY_NODE_RPC_SOCKET")]
    rpc_socket_path: Option<PathBuf>,

    /// Directory holding the persisted identity (§4.11) and other
    /// node-local state; defaults to the platform config directory.
    #[arg(long, env = "OVERLAY_NODE_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[arg(long, env = "RUST_LOG")]
    log_filter: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub controller_url: Url,
    pub stun_servers: Vec<SocketAddr>,
    pub rpc_socket_path: PathBuf,
    pub config_dir: Option<PathBuf>,
    pub log_filter: String,
}

impl NodeConfig {
    /// Loads defaults, overlays an optional config file, then
    /// overlays CLI flags/environment variables, in that precedence
    /// order.
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();
        Self::from_cli(cli)
    }

    fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str(&text)?
            }
            None => FileConfig::default(),
        };

        let stun_servers = if !cli.stun_servers.is_empty() {
            cli.stun_servers
        } else {
            file.stun_servers.unwrap_or_else(default_stun_servers)
        };

        Ok(Self {
            controller_url: cli.controller_url.or(file.controller_url).unwrap_or_else(default_controller_url),
            stun_servers,
            rpc_socket_path: cli
                .rpc_socket_path
                .or(file.rpc_socket_path)
                .unwrap_or_else(default_rpc_socket_path),
            config_dir: cli.config_dir.or(file.config_dir),
            log_filter: cli.log_filter.or(file.log_filter).unwrap_or_else(default_log_filter),
        })
    }
}
