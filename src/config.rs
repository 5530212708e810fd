//! Configuration module for stall-stream.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. With neither,
//! the defaults run the stock scenario: a 1 MiB body that stalls for 5s
//! after 500 bytes, aborted by the client after 3s.

use crate::payload::{BodyTimeout, StreamRequest};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "stall-stream")]
#[command(author = "stall-stream authors")]
#[command(version = "0.1.0")]
#[command(
    about = "Streams a paced, stalling HTTP body to itself and aborts the request mid-stream",
    long_about = None
)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (port 0 picks an ephemeral port)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Milliseconds before the client aborts its request
    #[arg(short = 'a', long)]
    pub cancel_after: Option<u64>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scenario: ScenarioConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// How long shutdown waits for open connections, in milliseconds
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Maximum accepted request body size in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            body_limit: default_body_limit(),
        }
    }
}

/// Client-side scenario configuration
#[derive(Debug, Deserialize)]
pub struct ScenarioConfig {
    /// Milliseconds before the request is aborted
    #[serde(default = "default_cancel_after_ms")]
    pub cancel_after_ms: u64,
    /// Request path of the POST
    #[serde(default = "default_path")]
    pub path: String,
    /// Total body size the server should stream
    pub size: Option<u64>,
    /// Server emission rate, bytes per second
    pub speed: Option<f64>,
    /// Server delay before the first byte, in milliseconds
    pub request_timeout_ms: Option<u64>,
    /// One-time stalls
    #[serde(default = "default_body_timeouts")]
    pub body_timeouts: Vec<BodyTimeout>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            cancel_after_ms: default_cancel_after_ms(),
            path: default_path(),
            size: None,
            speed: None,
            request_timeout_ms: None,
            body_timeouts: default_body_timeouts(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:0".to_string()
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_body_limit() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_cancel_after_ms() -> u64 {
    3000
}

fn default_path() -> String {
    "/yo".to_string()
}

fn default_body_timeouts() -> Vec<BodyTimeout> {
    vec![BodyTimeout {
        after: 500,
        time: 5000,
    }]
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub shutdown_timeout: Duration,
    pub body_limit: usize,
    pub cancel_after: Duration,
    pub path: String,
    pub request: StreamRequest,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            scenario,
            logging,
        } = toml_config;

        Config {
            listen: cli.listen.unwrap_or(server.listen),
            shutdown_timeout: Duration::from_millis(server.shutdown_timeout_ms),
            body_limit: server.body_limit,
            cancel_after: Duration::from_millis(
                cli.cancel_after.unwrap_or(scenario.cancel_after_ms),
            ),
            path: scenario.path,
            request: StreamRequest {
                request_timeout: scenario.request_timeout_ms,
                size: scenario.size,
                speed: scenario.speed,
                body_timeouts: scenario.body_timeouts,
            },
            log_level: cli.log_level.unwrap_or(logging.level),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::parse_from(["stall-stream"]), TomlConfig::default())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
