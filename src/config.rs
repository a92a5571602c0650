//! Configuration file parsing
//!
//! Parses TOML configuration files for a blockmesh node.

use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Node configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Node settings
    pub node: NodeConfig,

    /// Peer network settings
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Node settings
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Name advertised to peers; random when unset
    #[serde(default)]
    pub name: Option<String>,

    /// Root directory of the block store
    pub data_dir: PathBuf,

    /// Address the peer listener binds to
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen() -> String {
    "0.0.0.0:9080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Peer network settings
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// How long each peer gets to answer a file request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Peers dialled at start-up
    #[serde(default)]
    pub peers: Vec<String>,
}

fn default_request_timeout_ms() -> u64 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            peers: Vec::new(),
        }
    }
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    /// Defaults for a node storing its blocks under `data_dir`
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            node: NodeConfig {
                name: None,
                data_dir: data_dir.into(),
                listen: default_listen(),
                log_level: default_log_level(),
            },
            network: NetworkConfig::default(),
        }
    }

    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "network.request_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.node.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "node.listen is not a socket address: {:?}",
                self.node.listen
            )));
        }

        if let Some(name) = &self.node.name {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid("node.name must not be empty".to_string()));
            }
        }

        // Check for duplicate or empty peers
        let mut seen = HashSet::new();
        for peer in &self.network.peers {
            let peer = peer.trim();
            if peer.is_empty() {
                return Err(ConfigError::Invalid("empty peer address".to_string()));
            }
            if !seen.insert(peer) {
                return Err(ConfigError::Invalid(format!("duplicate peer: {}", peer)));
            }
        }

        Ok(())
    }
}
