//! Configuration management for the agent.
//!
//! Supports loading configuration from:
//! - YAML config files
//! - Environment variables

use crate::connection::{ConnectionSettings, SslMode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub push: PushConfig,
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Push endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    pub api_key: String,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub timeout: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Upper bound in seconds on one backend delivery, retries included
    #[serde(default = "default_send_timeout")]
    pub send_timeout: u64,
}

/// Monitored instance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Administrative database the agent connects to first
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default)]
    pub ssl_mode: SslMode,

    /// Per-query timeout in seconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: None,
            database: default_database(),
            ssl_mode: SslMode::default(),
            query_timeout: default_query_timeout(),
        }
    }
}

impl PostgresConfig {
    pub fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
            ssl_mode: self.ssl_mode,
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }
}

/// Metrics collection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl CollectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

// Default value functions
fn default_endpoint() -> String {
    "https://push.pgmon.io/v1/ingest".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_retries() -> u32 {
    3
}

fn default_send_timeout() -> u64 {
    60
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_query_timeout() -> u64 {
    30
}

fn default_interval_secs() -> u64 {
    60
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("PGMON_API_KEY")
            .map_err(|_| ConfigError::MissingField("PGMON_API_KEY".to_string()))?;

        let endpoint = std::env::var("PGMON_ENDPOINT").unwrap_or_else(|_| default_endpoint());

        let postgres = PostgresConfig {
            host: std::env::var("PGHOST").unwrap_or_else(|_| default_host()),
            port: std::env::var("PGPORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_port),
            user: std::env::var("PGUSER").unwrap_or_else(|_| default_user()),
            password: std::env::var("PGPASSWORD").ok(),
            database: std::env::var("PGDATABASE").unwrap_or_else(|_| default_database()),
            ssl_mode: std::env::var("PGSSLMODE")
                .ok()
                .and_then(|s| match s.to_lowercase().as_str() {
                    "disable" => Some(SslMode::Disable),
                    "prefer" => Some(SslMode::Prefer),
                    "require" => Some(SslMode::Require),
                    _ => None,
                })
                .unwrap_or_default(),
            query_timeout: default_query_timeout(),
        };

        let interval_secs = std::env::var("COLLECTION_INTERVAL")
            .ok()
            .and_then(|s| parse_duration_secs(&s))
            .unwrap_or_else(default_interval_secs);

        let log_level = std::env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(LogLevel::Trace),
                "debug" => Some(LogLevel::Debug),
                "info" => Some(LogLevel::Info),
                "warn" => Some(LogLevel::Warn),
                "error" => Some(LogLevel::Error),
                _ => None,
            })
            .unwrap_or_else(default_log_level);

        let log_format = std::env::var("LOG_FORMAT")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "json" => Some(LogFormat::Json),
                "pretty" => Some(LogFormat::Pretty),
                _ => None,
            })
            .unwrap_or_else(default_log_format);

        let config = Config {
            push: PushConfig {
                api_key,
                endpoint,
                timeout: default_request_timeout(),
                retries: default_retries(),
                send_timeout: default_send_timeout(),
            },
            postgres,
            collection: CollectionConfig { interval_secs },
            logging: LoggingConfig {
                level: log_level,
                format: log_format,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.push.api_key.is_empty() {
            return Err(ConfigError::ValidationError(
                "API key cannot be empty".to_string(),
            ));
        }

        if self.postgres.host.is_empty() {
            return Err(ConfigError::ValidationError(
                "PostgreSQL host cannot be empty".to_string(),
            ));
        }

        if self.collection.interval_secs < 10 {
            return Err(ConfigError::ValidationError(
                "Collection interval must be at least 10 seconds".to_string(),
            ));
        }

        Ok(())
    }
}

/// Expand environment variables in a string using ${VAR} syntax
fn expand_env_vars(input: &str) -> String {
    let re = Regex::new(r"\$\{([^}]+)\}").unwrap();
    let mut result = input.to_string();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Parse duration string like "60s", "5m", "1h" into seconds
fn parse_duration_secs(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (num_str, suffix) = if s.ends_with('s') {
        (&s[..s.len() - 1], 1u64)
    } else if s.ends_with('m') {
        (&s[..s.len() - 1], 60u64)
    } else if s.ends_with('h') {
        (&s[..s.len() - 1], 3600u64)
    } else {
        (s, 1u64)
    };

    num_str.parse::<u64>().ok().map(|n| n * suffix)
}
