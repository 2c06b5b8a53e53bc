//! Configuration management for the server.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use weft_engine::Schema;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Service token. When set, every connection must present it.
    pub auth_secret: Option<String>,
    /// Replica id stamped on timestamps issued by this server
    pub replica_id: String,
    /// JSON schema file; the server is schemaless without one
    pub schema_path: Option<PathBuf>,
    /// Directory for the clock sequence and store snapshot
    pub data_dir: Option<PathBuf>,
    /// How often buffered entity data is flushed to clients
    pub flush_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            auth_secret: None,
            replica_id: "server".to_string(),
            schema_path: None,
            data_dir: None,
            flush_interval: Duration::from_millis(20),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = env::var("HOST").unwrap_or(defaults.host);

        let port = match env::var("PORT") {
            Ok(port) => port.parse().map_err(|_| ConfigError::InvalidPort)?,
            Err(_) => defaults.port,
        };

        let auth_secret = env::var("AUTH_SECRET").ok().filter(|s| !s.is_empty());

        let replica_id = env::var("REPLICA_ID").unwrap_or(defaults.replica_id);
        if replica_id.is_empty() {
            return Err(ConfigError::InvalidReplicaId);
        }

        let schema_path = env::var("SCHEMA_PATH").ok().map(PathBuf::from);
        let data_dir = env::var("DATA_DIR").ok().map(PathBuf::from);

        let flush_interval = match env::var("FLUSH_INTERVAL_MS") {
            Ok(ms) => match ms.parse::<u64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms),
                _ => return Err(ConfigError::InvalidFlushInterval),
            },
            Err(_) => defaults.flush_interval,
        };

        Ok(Self {
            host,
            port,
            auth_secret,
            replica_id,
            schema_path,
            data_dir,
            flush_interval,
        })
    }

    /// Read the schema file, if one is configured.
    pub fn load_schema(&self) -> Result<Option<Schema>, ConfigError> {
        let Some(path) = &self.schema_path else {
            return Ok(None);
        };
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::SchemaRead(format!("{}: {}", path.display(), e)))?;
        let schema = serde_json::from_str(&text)
            .map_err(|e| ConfigError::SchemaParse(format!("{}: {}", path.display(), e)))?;
        Ok(Some(schema))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("REPLICA_ID must not be empty")]
    InvalidReplicaId,

    #[error("FLUSH_INTERVAL_MS must be a positive integer")]
    InvalidFlushInterval,

    #[error("Cannot read schema: {0}")]
    SchemaRead(String),

    #[error("Invalid schema: {0}")]
    SchemaParse(String),
}
