//! Configuration module for the bot's runtime settings
//!
//! Read once at startup from `configs/config.{json,yaml,yml}` and passed
//! around as `Arc<Config>`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{BotError, BotResult};

/// Lookup order inside the config directory; the first existing file wins
pub const CONFIG_FILES: [&str; 3] = ["config.json", "config.yaml", "config.yml"];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// License key, required
    #[serde(default)]
    pub license: String,

    /// RPC endpoints; the first one serves reads and sends
    #[serde(default)]
    pub rpc_list: Vec<String>,

    #[serde(default)]
    pub websocket_url: String,

    /// Pause between balance reads after a buy, milliseconds
    #[serde(default = "default_monitor_delay")]
    pub monitor_delay: u64,

    /// Base backoff for retried RPC reads, milliseconds
    #[serde(default = "default_rpc_delay")]
    pub rpc_delay: u64,

    /// Price polling interval of monitoring sessions, milliseconds
    #[serde(default = "default_price_delay")]
    pub price_delay: u64,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default)]
    pub tps_logging: bool,

    /// Attempts for transient read failures
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Concurrent task workers
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Config {
    /// Load the first config file found in `dir`
    pub fn load(dir: impl AsRef<Path>) -> BotResult<Self> {
        let path = Self::locate(dir.as_ref())?;
        let contents = fs::read_to_string(&path)
            .map_err(|e| BotError::Configuration(format!("failed to read {}: {}", path.display(), e)))?;
        let config = Self::parse(&path, &contents)?;
        config.validate()?;
        Ok(config)
    }

    fn locate(dir: &Path) -> BotResult<PathBuf> {
        CONFIG_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                BotError::Configuration(format!("no config file ({}) in {}", CONFIG_FILES.join(", "), dir.display()))
            })
    }

    /// Parse by file extension: `.json` as JSON, anything else as YAML
    pub fn parse(path: &Path, contents: &str) -> BotResult<Self> {
        let is_json = path.extension().and_then(|ext| ext.to_str()) == Some("json");
        let parsed = if is_json {
            serde_json::from_str(contents).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(contents).map_err(|e| e.to_string())
        };
        parsed.map_err(|e| BotError::Configuration(format!("failed to parse {}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> BotResult<()> {
        if self.license.trim().is_empty() {
            return Err(BotError::Configuration("license is required".to_string()));
        }
        if self.rpc_list.is_empty() {
            return Err(BotError::Configuration("rpc_list must contain at least one endpoint".to_string()));
        }
        for rpc in &self.rpc_list {
            Url::parse(rpc).map_err(|e| BotError::Configuration(format!("invalid rpc url '{}': {}", rpc, e)))?;
        }
        if self.websocket_url.trim().is_empty() {
            return Err(BotError::Configuration("websocket_url is required".to_string()));
        }
        Url::parse(&self.websocket_url)
            .map_err(|e| BotError::Configuration(format!("invalid websocket_url: {}", e)))?;
        if self.retries == 0 {
            return Err(BotError::Configuration("retries must be positive".to_string()));
        }
        if self.workers == 0 {
            return Err(BotError::Configuration("workers must be positive".to_string()));
        }
        Ok(())
    }

    pub fn primary_rpc(&self) -> &str {
        self.rpc_list.first().map(String::as_str).unwrap_or_default()
    }

    pub fn monitor_delay(&self) -> Duration {
        Duration::from_millis(self.monitor_delay)
    }

    pub fn rpc_delay(&self) -> Duration {
        Duration::from_millis(self.rpc_delay)
    }

    pub fn price_delay(&self) -> Duration {
        Duration::from_millis(self.price_delay)
    }

    /// Default log filter when `RUST_LOG` is unset
    pub fn log_level(&self) -> &'static str {
        if self.debug_logging { "debug" } else { "info" }
    }
}

// --- Default value functions for serde ---

fn default_monitor_delay() -> u64 { 500 }
fn default_rpc_delay() -> u64 { 200 }
fn default_price_delay() -> u64 { 1_000 }
fn default_retries() -> u32 { 3 }
fn default_workers() -> usize { 1 }
