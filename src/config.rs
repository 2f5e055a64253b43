//! Server configuration.
//!
//! Loaded from an optional TOML file; every key has a default, so an empty
//! (or absent) file yields a working local setup. Command-line flags in
//! `main` override the file.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Root configuration container.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    pub listen: SocketAddr,
    /// Instance inventory (JSON). Empty inventory when unset.
    pub inventory: Option<PathBuf>,
    pub tunnel: TunnelConfig,
    pub node_agent: NodeAgentConfig,
    pub feature_gates: FeatureGates,
}

// --- Sections ---

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub handshake_timeout_secs: u64,
    pub ping_interval_ms: u64,
    pub pong_wait_secs: u64,
    pub copy_buffer_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct NodeAgentConfig {
    pub port: u16,
    pub connect_timeout_secs: u64,
    /// Node name → agent host.
    pub nodes: HashMap<String, String>,
    /// Mutual TLS; plain TCP when absent.
    pub tls: Option<TlsPaths>,
}

/// PEM files for agent connections.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TlsPaths {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct FeatureGates {
    pub vsock: bool,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8443)),
            inventory: None,
            tunnel: TunnelConfig::default(),
            node_agent: NodeAgentConfig::default(),
            feature_gates: FeatureGates::default(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 10,
            ping_interval_ms: 1000,
            pong_wait_secs: 60,
            copy_buffer_bytes: 32 * 1024,
        }
    }
}

impl Default for NodeAgentConfig {
    fn default() -> Self {
        Self {
            port: 8186,
            connect_timeout_secs: 10,
            nodes: HashMap::new(),
            tls: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Accessors
// ---------------------------------------------------------------------------

impl TunnelConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    /// Never zero: a zero wait would expire the read deadline on arrival.
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs.max(1))
    }
}

impl NodeAgentConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Read `path`, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
