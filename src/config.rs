// src/config.rs

//! Manages server configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration of the Prometheus metrics endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9125
}

/// The server configuration, loaded from a TOML file with CLI overrides.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Address the RPC listener binds to.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    /// This server's rank in the fabric group.
    #[serde(default)]
    pub self_rank: u32,

    /// Directory holding the per-pool storage directories.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// I/O streams exposed per storage node.
    #[serde(default = "default_streams_per_node")]
    pub streams_per_node: u32,

    /// Service replicas requested when creating a pool.
    #[serde(default = "default_svc_replicas")]
    pub svc_replicas: usize,

    /// Sleep between replica rechoose attempts of the inter-service client.
    #[serde(with = "humantime_serde", default = "default_rechoose_backoff")]
    pub rechoose_backoff: Duration,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7521
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("peridot_data")
}

fn default_streams_per_node() -> u32 {
    1
}

fn default_svc_replicas() -> usize {
    3
}

fn default_rechoose_backoff() -> Duration {
    Duration::from_millis(1)
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            self_rank: 0,
            storage_path: default_storage_path(),
            streams_per_node: default_streams_per_node(),
            svc_replicas: default_svc_replicas(),
            rechoose_backoff: default_rechoose_backoff(),
            log_level: default_log_level(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.streams_per_node == 0 {
            return Err(anyhow!("streams_per_node cannot be 0"));
        }
        if self.svc_replicas == 0 {
            return Err(anyhow!("svc_replicas cannot be 0"));
        }
        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main server port"
                ));
            }
        }
        Ok(())
    }
}
