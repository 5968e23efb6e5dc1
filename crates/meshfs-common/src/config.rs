//! Configuration types for meshfs
//!
//! The metadata server reads a TOML file; every field has a default so an
//! empty or missing file yields a working single-process setup.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration for the metadata server
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Send queue (outbound dispatch) configuration
    pub sendq: SendqConfig,
    /// Back channel to storage nodes
    pub back_channel: BackChannelConfig,
    /// Storage nodes known at startup
    pub nodes: Vec<NodeConfig>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.sendq.worker_threads == 0 {
            return Err(Error::configuration("sendq.worker_threads must be > 0"));
        }
        if self.sendq.job_queue_length == 0 {
            return Err(Error::configuration("sendq.job_queue_length must be > 0"));
        }
        let bc = &self.back_channel;
        for (name, window) in [
            ("status_window", bc.status_window),
            ("remove_window", bc.remove_window),
            ("replication_window", bc.replication_window),
        ] {
            if window == 0 {
                return Err(Error::configuration(format!(
                    "back_channel.{name} must be > 0"
                )));
            }
        }
        for node in &self.nodes {
            if node.address.is_empty() {
                return Err(Error::configuration(format!(
                    "node {} has no address",
                    node.name
                )));
            }
        }
        Ok(())
    }
}

/// Send queue configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SendqConfig {
    /// Number of workers performing sends concurrently
    pub worker_threads: usize,
    /// Jobs that may wait for a free worker before dispatch blocks
    pub job_queue_length: usize,
}

impl Default for SendqConfig {
    fn default() -> Self {
        Self {
            worker_threads: 16,
            job_queue_length: 160, // worker_threads * 10
        }
    }
}

/// Back channel (metadata server -> storage node) configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackChannelConfig {
    /// Outstanding status probes per node
    pub status_window: usize,
    /// Outstanding replica removals per node
    pub remove_window: usize,
    /// Outstanding replication requests per node
    pub replication_window: usize,
    /// Timeout for one request/reply exchange (milliseconds)
    pub request_timeout_ms: u64,
    /// Interval between status probes (milliseconds)
    pub heartbeat_interval_ms: u64,
    /// Delay before re-sending a removal a busy node refused (milliseconds)
    pub busy_retry_ms: u64,
}

impl Default for BackChannelConfig {
    fn default() -> Self {
        Self {
            status_window: 1,
            remove_window: 10,
            replication_window: 10,
            request_timeout_ms: 5000,
            heartbeat_interval_ms: 1000,
            busy_retry_ms: 1000,
        }
    }
}

/// A storage node entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable node name
    pub name: String,
    /// Back channel address (host:port)
    pub address: String,
    /// Stable node ID; generated at startup when absent
    #[serde(default)]
    pub id: Option<String>,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
