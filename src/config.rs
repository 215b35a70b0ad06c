//! Configuration schema and loading.
//!
//! Layers: defaults, then an optional TOML file, then environment overrides
//! (`WEFT_LISTEN`, `WEFT_TOKEN`, `WEFT_LOG`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Limits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub limits: Limits,
    pub server: ServerConfig,
    pub client: ClientSideConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub heartbeat_window_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7440".to_string(),
            heartbeat_window_ms: 30_000,
            sweep_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSideConfig {
    pub server_addr: String,
    pub token: String,
    pub auto_reconnect: bool,
    pub max_reconnect_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for ClientSideConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7440".to_string(),
            token: String::new(),
            auto_reconnect: true,
            max_reconnect_delay_ms: 30_000,
            heartbeat_interval_ms: 15_000,
        }
    }
}

impl ClientSideConfig {
    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// EnvFilter directive; `WEFT_LOG`/`RUST_LOG` override.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            filter: "info".to_string(),
        }
    }
}

/// Load a config file, or defaults when `path` is `None`.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        }
        None => Config::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(listen) = std::env::var("WEFT_LISTEN") {
        config.server.listen_addr = listen;
    }
    if let Ok(token) = std::env::var("WEFT_TOKEN") {
        config.client.token = token;
    }
    if let Ok(filter) = std::env::var("WEFT_LOG") {
        config.logging.filter = filter;
    }
}
