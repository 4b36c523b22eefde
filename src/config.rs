use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use validator::Validate;

pub const CONFIG_FILE: &str = "config/default.toml";
pub const ENV_PREFIX: &str = "HUB__";

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub storage: StorageConfig,
    #[validate(nested)]
    pub blueprints: BlueprintConfig,
    pub devices: DevicesConfig,
    #[validate(nested)]
    pub ingest: IngestConfig,
    #[validate(nested)]
    pub gateway: GatewayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    pub port: u16,
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            enable_cors: false,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StorageConfig {
    #[validate(length(min = 1))]
    pub database_url: String,
    #[validate(range(min = 1))]
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
    /// Retries after the first attempt on busy/locked
    pub busy_retries: u32,
    pub busy_backoff_ms: u64,
    #[validate(range(min = 1))]
    pub retention_days: u32,
    #[validate(range(min = 1))]
    pub cleanup_interval_minutes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/telemetry.db".to_string(),
            max_connections: 5,
            busy_timeout_ms: 5_000,
            busy_retries: 3,
            busy_backoff_ms: 200,
            retention_days: 30,
            cleanup_interval_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BlueprintConfig {
    pub directory: PathBuf,
    #[validate(range(min = 1))]
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
}

impl Default for BlueprintConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("blueprints"),
            cache_capacity: 128,
            cache_ttl_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    pub config_file: PathBuf,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from("config/devices.yaml"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct IngestConfig {
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GatewayConfig {
    /// Outbound frames buffered per websocket client
    #[validate(range(min = 1))]
    pub client_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { client_buffer: 64 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Used when RUST_LOG is unset
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,tower_http=info,sqlx=warn".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().context("invalid configuration")?;
        config.validate().context("configuration failed validation")?;
        Ok(config)
    }
}
