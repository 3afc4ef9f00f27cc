//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ramutex_core::NodeId;
use serde::Deserialize;

use crate::coordinator::Settings;

/// Node configuration. File: ~/.config/ramutex/config.toml or /etc/ramutex/config.toml.
/// Env overrides: RAMUTEX_NODE_ID, RAMUTEX_PORT, RAMUTEX_POLL_MS, RAMUTEX_STATE_MS, RAMUTEX_REPLY_TIMEOUT_MS.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// This node's id (default 1). Must be unique among participants.
    #[serde(default = "default_node_id")]
    pub node_id: u32,
    /// Listen address (default 0.0.0.0).
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,
    /// Listen port (default 5000). 0 picks an ephemeral port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Peers dialed at startup.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
    /// Admission poll fallback interval (default 10 ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Periodic STATE broadcast interval (default 50 ms).
    #[serde(default = "default_state_interval_ms")]
    pub state_interval_ms: u64,
    /// Per-request reply lease; 0 waits forever (default 0).
    #[serde(default)]
    pub reply_timeout_ms: u64,
    /// Remote presence expiry (default 1000 ms).
    #[serde(default = "default_liveness_window_ms")]
    pub liveness_window_ms: u64,
}

/// A peer to dial: its id and `host:port`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PeerEntry {
    pub id: u32,
    pub addr: String,
}

impl std::str::FromStr for PeerEntry {
    type Err = ConfigError;

    /// `<id>@<host:port>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s
            .split_once('@')
            .ok_or_else(|| ConfigError::Peer(s.to_string()))?;
        let id = id.parse().map_err(|_| ConfigError::Peer(s.to_string()))?;
        if addr.is_empty() {
            return Err(ConfigError::Peer(s.to_string()));
        }
        Ok(Self {
            id,
            addr: addr.to_string(),
        })
    }
}

fn default_node_id() -> u32 {
    1
}
fn default_bind_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_listen_port() -> u16 {
    5000
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_state_interval_ms() -> u64 {
    50
}
fn default_liveness_window_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            bind_host: default_bind_host(),
            listen_port: default_listen_port(),
            peers: Vec::new(),
            poll_interval_ms: default_poll_interval_ms(),
            state_interval_ms: default_state_interval_ms(),
            reply_timeout_ms: 0,
            liveness_window_ms: default_liveness_window_ms(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid peer {0:?}, expected <id>@<host:port>")]
    Peer(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("peer entry uses this node's own id {0}")]
    SelfPeer(u32),
}

impl Config {
    /// Reject settings the coordinator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Zero("poll_interval_ms"));
        }
        if self.state_interval_ms == 0 {
            return Err(ConfigError::Zero("state_interval_ms"));
        }
        if self.liveness_window_ms == 0 {
            return Err(ConfigError::Zero("liveness_window_ms"));
        }
        if self.peers.iter().any(|p| p.id == self.node_id) {
            return Err(ConfigError::SelfPeer(self.node_id));
        }
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId(self.node_id)
    }

    pub fn state_interval(&self) -> Duration {
        Duration::from_millis(self.state_interval_ms)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }

    /// Coordinator settings derived from this config.
    pub fn settings(&self) -> Settings {
        Settings {
            node_id: self.node_id(),
            bind: SocketAddr::new(self.bind_host, self.listen_port),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            reply_timeout: (self.reply_timeout_ms > 0)
                .then(|| Duration::from_millis(self.reply_timeout_ms)),
        }
    }

    /// Command-line overrides, applied last. `peers` add to the configured ones.
    pub fn apply_overrides(
        &mut self,
        node_id: Option<u32>,
        port: Option<u16>,
        peers: Vec<PeerEntry>,
    ) {
        if let Some(id) = node_id {
            self.node_id = id;
        }
        if let Some(port) = port {
            self.listen_port = port;
        }
        self.peers.extend(peers);
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_parse("RAMUTEX_NODE_ID") {
            self.node_id = v;
        }
        if let Some(v) = env_parse("RAMUTEX_PORT") {
            self.listen_port = v;
        }
        if let Some(v) = env_parse("RAMUTEX_POLL_MS") {
            self.poll_interval_ms = v;
        }
        if let Some(v) = env_parse("RAMUTEX_STATE_MS") {
            self.state_interval_ms = v;
        }
        if let Some(v) = env_parse("RAMUTEX_REPLY_TIMEOUT_MS") {
            self.reply_timeout_ms = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Load config: default, then config file (explicit path, or the first standard path present), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    c.apply_env();
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ramutex/config.toml"));
    }
    out.push(PathBuf::from("/etc/ramutex/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}
