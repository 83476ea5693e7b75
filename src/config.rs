use serde::Deserialize;
use std::fs;

use crate::error::{DfsError, Result};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,
    pub metadata_path: String,
    pub log_path: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            metadata_path: "dfs_metadata.json".to_string(),
            log_path: "logs".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub ports_start: u16, // Base for auto-assigned node ports
    pub storage_root: String,
    pub log_path: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ports_start: 6000,
            storage_root: "dfs_storage".to_string(),
            log_path: "logs".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub log_path: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_path: "logs".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    pub block_size: u64,             // Chunk size in bytes
    pub replication_factor: usize,   // Number of chunk replicas
    pub heartbeat_interval: u64,     // Node heartbeat period in seconds
    pub node_timeout: u64,           // Seconds of silence before a node is OFFLINE
    pub failure_check_interval: u64, // Failure detector tick in seconds
    pub log_level: String,           // Log level (e.g., "debug", "info", etc.)
    pub log_output: String,          // Log output ("stdout" or "file")
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            block_size: 1024 * 1024,
            replication_factor: 2,
            heartbeat_interval: 2,
            node_timeout: 6,
            failure_check_interval: 1,
            log_level: "info".to_string(),
            log_output: "stdout".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub master: MasterConfig,
    pub node: NodeConfig,
    pub client: ClientConfig,
    pub common: CommonConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.common.block_size == 0 {
            return Err(DfsError::Config("block_size must be non-zero".to_string()));
        }
        if self.common.replication_factor == 0 {
            return Err(DfsError::Config(
                "replication_factor must be at least 1".to_string(),
            ));
        }
        if self.common.node_timeout < 3 * self.common.heartbeat_interval {
            return Err(DfsError::Config(format!(
                "node_timeout ({}) must be at least 3 * heartbeat_interval ({})",
                self.common.node_timeout, self.common.heartbeat_interval
            )));
        }
        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<Config> {
    // Read the config file
    let config_content = fs::read_to_string(path)?;
    // Parse the TOML content into the Config struct
    let config: Config =
        toml::from_str(&config_content).map_err(|e| DfsError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration, falling back to defaults if the file is missing or invalid.
pub fn load_or_default(path: &str) -> Config {
    match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, path = %path, "failed to load config, using defaults");
            Config::default()
        }
    }
}
