//! Service configuration.
//!
//! Configuration is read from a YAML file selected with `-c` and each key
//! can be overridden by a `JOB_SERVICE_*` environment variable; overrides
//! win over file values. Missing required values abort startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error while reading the config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The YAML failed to parse.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// An override or file value has an invalid form.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// A required value is missing.
    #[error("missing required config value: {0}")]
    Missing(String),
}

/// Listening protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// TLS material used when the protocol is https.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpsConfig {
    /// Path to the certificate file.
    pub cert: String,
    /// Path to the private key file.
    pub key: String,
}

/// Redis endpoint and key namespace for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisPoolConfig {
    /// Redis host.
    pub host: String,
    /// Redis port.
    #[serde(default = "default_redis_port")]
    pub port: u16,
    /// Key namespace shared by cooperating instances.
    pub namespace: String,
}

impl RedisPoolConfig {
    /// Connection URL in the form the redis client expects.
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Queue backend; `redis` is the only supported value.
    pub backend: String,
    /// Number of workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Redis endpoint and namespace.
    pub redis_pool: RedisPoolConfig,
}

/// Logger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Directory log files are written to.
    pub base_path: PathBuf,
    /// One of DEBUG, INFO, WARNING, ERROR.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Hours a log file is kept before the sweeper removes it.
    #[serde(default = "default_archive_period")]
    pub archive_period: u64,
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `http` or `https`.
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    /// Listening port.
    pub port: u16,
    /// TLS material, required when protocol is https.
    #[serde(default)]
    pub https_config: Option<HttpsConfig>,
    /// Worker pool settings.
    pub pool: PoolConfig,
    /// Logger settings.
    pub logger: LoggerConfig,
    /// Out-of-scope admin server endpoint, recorded but unused here.
    #[serde(default)]
    pub admin_server: Option<String>,
}

fn default_protocol() -> Protocol {
    Protocol::Http
}

fn default_redis_port() -> u16 {
    6379
}

fn default_workers() -> usize {
    8
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_archive_period() -> u64 {
    24
}

impl Config {
    /// Loads configuration from a YAML file, applies `JOB_SERVICE_*`
    /// environment overrides and validates the result.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&raw)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies environment overrides through a lookup function.
    ///
    /// The lookup indirection keeps the override logic testable without
    /// mutating the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("JOB_SERVICE_PROTOCOL") {
            self.protocol = v
                .parse()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "JOB_SERVICE_PROTOCOL".into(),
                    message,
                })?;
        }
        if let Some(v) = lookup("JOB_SERVICE_PORT") {
            self.port = parse_num(&v, "JOB_SERVICE_PORT")?;
        }
        if let Some(cert) = lookup("JOB_SERVICE_HTTPS_CERT") {
            let key = lookup("JOB_SERVICE_HTTPS_KEY").unwrap_or_else(|| {
                self.https_config
                    .as_ref()
                    .map(|c| c.key.clone())
                    .unwrap_or_default()
            });
            self.https_config = Some(HttpsConfig { cert, key });
        }
        if let Some(v) = lookup("JOB_SERVICE_POOL_BACKEND") {
            self.pool.backend = v;
        }
        if let Some(v) = lookup("JOB_SERVICE_POOL_WORKERS") {
            self.pool.workers = parse_num(&v, "JOB_SERVICE_POOL_WORKERS")?;
        }
        if let Some(v) = lookup("JOB_SERVICE_POOL_REDIS_HOST") {
            self.pool.redis_pool.host = v;
        }
        if let Some(v) = lookup("JOB_SERVICE_POOL_REDIS_PORT") {
            self.pool.redis_pool.port = parse_num(&v, "JOB_SERVICE_POOL_REDIS_PORT")?;
        }
        if let Some(v) = lookup("JOB_SERVICE_POOL_REDIS_NAMESPACE") {
            self.pool.redis_pool.namespace = v;
        }
        if let Some(v) = lookup("JOB_SERVICE_LOGGER_BASE_PATH") {
            self.logger.base_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("JOB_SERVICE_LOGGER_LEVEL") {
            self.logger.level = v;
        }
        if let Some(v) = lookup("JOB_SERVICE_LOGGER_ARCHIVE_PERIOD") {
            self.logger.archive_period = parse_num(&v, "JOB_SERVICE_LOGGER_ARCHIVE_PERIOD")?;
        }
        if let Some(v) = lookup("JOB_SERVICE_ADMIN_SERVER") {
            self.admin_server = Some(v);
        }
        Ok(())
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "port".into(),
                message: "must be non-zero".into(),
            });
        }
        if self.protocol == Protocol::Https && self.https_config.is_none() {
            return Err(ConfigError::Missing("https_config".into()));
        }
        if self.pool.backend != "redis" {
            return Err(ConfigError::InvalidValue {
                key: "pool.backend".into(),
                message: format!("must be 'redis', got '{}'", self.pool.backend),
            });
        }
        if self.pool.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pool.workers".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.pool.redis_pool.host.is_empty() {
            return Err(ConfigError::Missing("pool.redis_pool.host".into()));
        }
        if self.pool.redis_pool.namespace.is_empty() {
            return Err(ConfigError::Missing("pool.redis_pool.namespace".into()));
        }
        if self.logger.base_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("logger.base_path".into()));
        }
        match self.logger.level.as_str() {
            "DEBUG" | "INFO" | "WARNING" | "ERROR" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "logger.level".into(),
                    message: format!("unknown level '{}'", other),
                });
            }
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{}' is not a valid number", value),
    })
}
