//! Node configuration.
//!
//! The embedding bot supplies its identity (instance name, bot user id,
//! environment); everything transport-related comes from `P2P_*`
//! environment variables resolved once at startup.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Deployment environment carried in the hello frame. Nodes from
/// different environments refuse to mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunEnv {
    Prod,
    Dev,
}

impl std::fmt::Display for RunEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunEnv::Prod => write!(f, "prod"),
            RunEnv::Dev => write!(f, "dev"),
        }
    }
}

/// Protocol timing knobs. Production values are fixed; tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// Period of the heartbeat broadcast.
    pub heartbeat_interval: Duration,
    /// Period of the liveness / election / reconciliation tick.
    pub check_interval: Duration,
    /// Slack on top of `heartbeat_interval` before a silent peer is dead.
    pub dead_grace: Duration,
    /// Pause between full outbound passes over the peer table.
    pub peer_retry: Duration,
    /// Wait after an empty outbound pass before the solo fallback.
    pub give_up: Duration,
    /// Deadline for TCP connect + TLS + hello on one connection.
    pub handshake_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            heartbeat_interval: Duration::from_secs(10),
            check_interval: Duration::from_secs(5),
            dead_grace: Duration::from_secs(2),
            peer_retry: Duration::from_secs(25),
            give_up: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl Timings {
    /// A peer that has been silent this long is no longer alive.
    pub fn dead_after(&self) -> Duration {
        self.heartbeat_interval + self.dead_grace
    }
}

/// Resolved configuration for one sync node.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Unique instance name, the key under which peers know us.
    pub instance: String,
    /// Identity of the bot principal. Peers with a different one are refused.
    pub user_id: String,
    pub env: RunEnv,
    /// Protocol version carried in hello; mismatches are refused.
    pub version: String,
    /// Listen port (`P2P_SYNC_PORT`).
    pub port: u16,
    /// Advertised endpoint (`P2P_MY_ADDRESS`), host:port.
    pub my_address: Option<String>,
    /// Statically configured peer endpoints (`P2P_PEERS`).
    pub peers: Vec<String>,
    /// Modules to request from the controller at connect
    /// (`P2P_PREFERRED_MODULES`).
    pub preferred_modules: Vec<String>,
    /// Election rank, lower wins. Defaults to wall-clock ms at startup so
    /// independently started nodes get distinct values.
    pub priority: i64,
    /// Directory holding the five PEM files.
    pub cert_dir: PathBuf,
    /// Peer address cache file.
    pub cache_path: PathBuf,
    pub timings: Timings,
}

pub const DEFAULT_CACHE_PATH: &str = "./.cache/SyncHandler/p2p-cache.json";
pub const DEFAULT_CERT_DIR: &str = "./certs";

impl SyncConfig {
    /// Minimal configuration with defaults for everything not passed in.
    pub fn new(
        instance: impl Into<String>,
        user_id: impl Into<String>,
        env: RunEnv,
        port: u16,
    ) -> Self {
        SyncConfig {
            instance: instance.into(),
            user_id: user_id.into(),
            env,
            version: env!("CARGO_PKG_VERSION").to_string(),
            port,
            my_address: None,
            peers: Vec::new(),
            preferred_modules: Vec::new(),
            priority: startup_priority(),
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
            cache_path: PathBuf::from(DEFAULT_CACHE_PATH),
            timings: Timings::default(),
        }
    }

    /// Read the `P2P_*` environment variables.
    ///
    /// `P2P_SYNC_PORT` is required and must be nonzero; every entry of
    /// `P2P_PEERS` must be a valid IPv4 or IPv6 host:port.
    pub fn from_env(
        instance: impl Into<String>,
        user_id: impl Into<String>,
        env: RunEnv,
    ) -> Result<Self> {
        let port = match std::env::var("P2P_SYNC_PORT") {
            Ok(v) => parse_port(&v)?,
            Err(_) => return Err(SyncError::Config("P2P_SYNC_PORT is not set".into())),
        };

        let mut config = SyncConfig::new(instance, user_id, env, port);
        config.my_address = std::env::var("P2P_MY_ADDRESS").ok().filter(|s| !s.is_empty());

        if let Ok(list) = std::env::var("P2P_PEERS") {
            config.peers = parse_peer_list(&list)?;
        }
        if let Ok(list) = std::env::var("P2P_PREFERRED_MODULES") {
            config.preferred_modules = parse_module_list(&list);
        }
        Ok(config)
    }
}

fn parse_port(raw: &str) -> Result<u16> {
    let port: u16 = raw
        .trim()
        .parse()
        .map_err(|_| SyncError::Config(format!("invalid P2P_SYNC_PORT: {raw:?}")))?;
    if port == 0 {
        return Err(SyncError::Config("P2P_SYNC_PORT must be nonzero".into()));
    }
    Ok(port)
}

/// Parse and validate a comma-separated `host:port` list.
pub fn parse_peer_list(raw: &str) -> Result<Vec<String>> {
    let mut peers = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        validate_peer_addr(entry)?;
        if !peers.iter().any(|p| p == entry) {
            peers.push(entry.to_string());
        }
    }
    Ok(peers)
}

/// `host:port` where host is a literal IPv4 or bracketed IPv6 address.
pub fn validate_peer_addr(entry: &str) -> Result<()> {
    let (host, port) = entry
        .rsplit_once(':')
        .ok_or_else(|| SyncError::Config(format!("peer {entry:?} is not host:port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| SyncError::Config(format!("peer {entry:?} has an invalid port")))?;
    if port == 0 {
        return Err(SyncError::Config(format!("peer {entry:?} has port 0")));
    }
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    host.parse::<IpAddr>()
        .map_err(|_| SyncError::Config(format!("peer {entry:?}: host is not IPv4 or IPv6")))?;
    Ok(())
}

fn parse_module_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Wall-clock milliseconds at process start, used as the election rank.
fn startup_priority() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
