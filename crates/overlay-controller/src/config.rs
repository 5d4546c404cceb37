//! Three-tier settings (§6): built-in defaults, an optional JSON
//! config file, then CLI flags/environment variables on top — the
//! same precedence order `overlay-logging`'s `RUST_LOG` layering
//! follows, driven here by `clap`'s own `env` attribute instead of a
//! hand-rolled merge.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use overlay_model::OverlayPrefix;
use serde::Deserialize;

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:7000".parse().expect("valid default bind address")
}

fn default_prefix() -> OverlayPrefix {
    OverlayPrefix::new(std::net::Ipv4Addr::new(100, 70, 0, 0), 24).expect("valid default prefix")
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_auth_expiry_days() -> i64 {
    30
}

/// The optional config-file layer; every field is optional so a
/// partial file only overrides what it mentions.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    bind_addr: Option<SocketAddr>,
    overlay_prefix: Option<OverlayPrefix>,
    auth_expiry_days: Option<i64>,
    log_filter: Option<String>,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "overlay controller: auth, IP allocation, signaling broker")]
struct Cli {
    /// Path to an optional JSON config file.
    #[arg(long, env = "OVERLAY_CONTROLLER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "OVERLAY_CONTROLLER_BIND")]
    bind_addr: Option<SocketAddr>,

    #[arg(long, env = "OVERLAY_CONTROLLER_PREFIX")]
    overlay_prefix: Option<OverlayPrefix>,

    #[arg(long, env = "OVERLAY_CONTROLLER_AUTH_EXPIRY_DAYS")]
    auth_expiry_days: Option<i64>,

    #[arg(long, env = "RUST_LOG")]
    log_filter: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub bind_addr: SocketAddr,
    pub overlay_prefix: OverlayPrefix,
    pub auth_expiry_days: i64,
    pub log_filter: String,
}

impl ControllerConfig {
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

        Ok(Self {
            bind_addr: cli.bind_addr.or(file.bind_addr).unwrap_or_else(default_bind_addr),
            overlay_prefix: cli.overlay_prefix.or(file.overlay_prefix).unwrap_or_else(default_prefix),
            auth_expiry_days: cli
                .auth_expiry_days
                .or(file.auth_expiry_days)
                .unwrap_or_else(default_auth_expiry_days),
            log_filter: cli.log_filter.or(file.log_filter).unwrap_or_else(default_log_filter),
        })
    }
}
