//! Configuration module for poll-echo.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. With neither,
//! the server listens on `0.0.0.0:6969`.

use clap::Parser;
use serde::Deserialize;
use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "poll-echo")]
#[command(author = "poll-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:6969)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog for pending connections
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Maximum number of tracked connections
    #[arg(short = 'c', long)]
    pub max_connections: Option<usize>,

    /// Number of readiness events collected per wait
    #[arg(long)]
    pub event_capacity: Option<usize>,

    /// Maximum bytes read from a client per read call
    #[arg(long)]
    pub read_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and event loop configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum number of tracked connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Readiness events collected per wait
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Per-connection I/O configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Bytes read per read call
    #[serde(default = "default_read_size")]
    pub read_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_size: default_read_size(),
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
    "0.0.0.0:6969".to_string()
}

fn default_backlog() -> u32 {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_event_capacity() -> usize {
    1024
}

fn default_read_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: u32,
    pub max_connections: usize,
    pub event_capacity: usize,
    pub read_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 6969)),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            event_capacity: default_event_capacity(),
            read_size: default_read_size(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|e| ConfigError::InvalidListen(listen.clone(), e))?;

        let config = Config {
            listen,
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            event_capacity: cli
                .event_capacity
                .unwrap_or(toml_config.server.event_capacity),
            read_size: cli.read_size.unwrap_or(toml_config.connection.read_size),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 {
            return Err(ConfigError::InvalidValue("backlog"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("max_connections"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue("event_capacity"));
        }
        if self.read_size == 0 {
            return Err(ConfigError::InvalidValue("read_size"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String, AddrParseError),
    InvalidValue(&'static str),
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
            ConfigError::InvalidListen(addr, e) => {
                write!(f, "Invalid listen address '{}': {}", addr, e)
            }
            ConfigError::InvalidValue(field) => {
                write!(f, "Invalid configuration: {} must be greater than zero", field)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
