use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::blockchain::ChainParams;
use crate::network::SyncSettings;

const DEFAULT_DATA_DIR: &str = "data/blockchain";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Node settings, read from the environment
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub bind_addr: String,
    pub port: u16,

    /// URL other nodes should use to reach us; announced to new peers
    pub public_url: Option<String>,

    /// Port assumed for hosts that push blocks without registering
    pub peer_port: u16,

    pub sync_interval: Duration,
    pub sync_cooldown: Duration,
    pub peer_timeout: Duration,
    pub fee_rate: u64,
    pub bootstrap_peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            port: DEFAULT_PORT,
            public_url: None,
            peer_port: DEFAULT_PORT,
            sync_interval: Duration::from_secs(30),
            sync_cooldown: Duration::from_secs(60),
            peer_timeout: Duration::from_secs(3),
            fee_rate: ChainParams::default().fee_rate,
            bootstrap_peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset or empty keys keep defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = NodeConfig::default();

        Ok(NodeConfig {
            data_dir: get("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            port: parse(get("PORT"), "PORT", defaults.port)?,
            public_url: get("PUBLIC_URL"),
            peer_port: parse(get("PEER_PORT"), "PEER_PORT", defaults.peer_port)?,
            sync_interval: Duration::from_secs(parse(get("SYNC_INTERVAL_SECS"), "SYNC_INTERVAL_SECS", 30)?),
            sync_cooldown: Duration::from_secs(parse(get("SYNC_COOLDOWN_SECS"), "SYNC_COOLDOWN_SECS", 60)?),
            peer_timeout: Duration::from_secs(parse(get("PEER_TIMEOUT_SECS"), "PEER_TIMEOUT_SECS", 3)?),
            fee_rate: parse(get("FEE_RATE"), "FEE_RATE", defaults.fee_rate)?,
            bootstrap_peers: get("BOOTSTRAP_PEERS")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|url| !url.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    /// Consensus parameters with the configured fee rate
    pub fn chain_params(&self) -> ChainParams {
        ChainParams {
            fee_rate: self.fee_rate,
            ..ChainParams::default()
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            peer_port: self.peer_port,
            pull_cooldown: self.sync_cooldown,
        }
    }
}

fn parse<T: FromStr>(value: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError> {
    match value {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}
