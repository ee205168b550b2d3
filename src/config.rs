//! Configuration management for the skipchain service

use crate::blockchain::{DEFAULT_BASE_HEIGHT, DEFAULT_MAXIMUM_HEIGHT};
use crate::error::ChainError;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "skipchain.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Parameters given to every new skipchain.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_base_height")]
    pub base_height: u32,
    #[serde(default = "default_maximum_height")]
    pub maximum_height: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            base_height: default_base_height(),
            maximum_height: default_maximum_height(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_streaming_capacity")]
    pub channel_capacity: usize,
    /// How long a notification waits on a full subscriber before evicting it.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl StreamingConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_streaming_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationConfig {
    #[serde(default = "default_pagination_capacity")]
    pub channel_capacity: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_pagination_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file; empty keeps blocks in memory only.
    #[serde(default)]
    pub path: String,
}

fn default_base_height() -> u32 {
    DEFAULT_BASE_HEIGHT
}

fn default_maximum_height() -> u32 {
    DEFAULT_MAXIMUM_HEIGHT
}

fn default_streaming_capacity() -> usize {
    crate::streaming::DEFAULT_CHANNEL_CAPACITY
}

fn default_send_timeout_ms() -> u64 {
    crate::streaming::DEFAULT_SEND_TIMEOUT.as_millis() as u64
}

fn default_pagination_capacity() -> usize {
    crate::pagination::DEFAULT_CHANNEL_CAPACITY
}

impl Config {
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.chain.base_height < 1 {
            return Err(ChainError::ConfigError("chain.base_height must be >= 1".to_string()));
        }
        if self.chain.maximum_height < 1 {
            return Err(ChainError::ConfigError("chain.maximum_height must be >= 1".to_string()));
        }
        if self.streaming.channel_capacity < 1 {
            return Err(ChainError::ConfigError("streaming.channel_capacity must be >= 1".to_string()));
        }
        if self.streaming.send_timeout_ms == 0 {
            return Err(ChainError::ConfigError("streaming.send_timeout_ms must be > 0".to_string()));
        }
        if self.pagination.channel_capacity < 1 {
            return Err(ChainError::ConfigError("pagination.channel_capacity must be >= 1".to_string()));
        }
        Ok(())
    }
}

pub fn parse_config(config_str: &str) -> Result<Config, ChainError> {
    let config: Config = toml::from_str(config_str)?;
    config.validate()?;
    Ok(config)
}

/// Loads `path`, falling back to defaults when the file is absent or empty.
pub fn load_config_from(path: &Path) -> Result<Config, ChainError> {
    let config_str = fs::read_to_string(path).unwrap_or_default();
    if config_str.trim().is_empty() {
        return Ok(Config::default());
    }
    parse_config(&config_str)
}

pub fn load_config() -> Result<Config, ChainError> {
    load_config_from(Path::new(DEFAULT_CONFIG_PATH))
}
