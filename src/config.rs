//! Configuration module for the line relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::relay::{Endpoint, IdentityKind, OverflowPolicy, RelayPolicy, SessionSettings};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "line-relay")]
#[command(author = "line-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A newline-delimited text broadcast relay", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long, global = true)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server
    Serve {
        /// Address to listen on (e.g. 127.0.0.1:9000 or unix:/tmp/relay.sock)
        listen: Option<Endpoint>,
    },
    /// Connect to a relay and chat over stdin/stdout
    Connect {
        /// Address of the relay (e.g. 127.0.0.1:9000 or unix:/tmp/relay.sock)
        addr: Endpoint,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum number of registered sessions
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Pause after a failed accept, in milliseconds
    #[serde(default = "default_accept_backoff_ms")]
    pub accept_backoff_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_clients: default_max_clients(),
            backlog: default_backlog(),
            accept_backoff_ms: default_accept_backoff_ms(),
        }
    }
}

/// Per-session I/O configuration
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Capacity of each session's outbound queue
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    /// What to do when the outbound queue is full
    #[serde(default)]
    pub overflow: OverflowPolicy,
    /// Maximum accepted line length in bytes
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Seconds without a complete line before disconnecting (0 = never)
    #[serde(default)]
    pub idle_timeout: u64,
    /// Seconds a single write may take (0 = unbounded)
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: default_outbound_capacity(),
            overflow: OverflowPolicy::default(),
            max_line_length: default_max_line_length(),
            idle_timeout: 0,
            write_timeout: default_write_timeout(),
        }
    }
}

/// Relay behaviour configuration
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    /// Deliver a sender's own lines back to it
    #[serde(default = "default_true")]
    pub echo_to_sender: bool,
    /// Identity assignment strategy
    #[serde(default)]
    pub identity: IdentityKind,
    /// Name (or name prefix) used by the identity strategy
    #[serde(default = "default_name")]
    pub default_name: String,
    /// Broadcast join/leave notices
    #[serde(default)]
    pub announce: bool,
    /// Accept `/nick <name>` lines
    #[serde(default)]
    pub allow_rename: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            echo_to_sender: true,
            identity: IdentityKind::default(),
            default_name: default_name(),
            announce: false,
            allow_rename: false,
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
    "127.0.0.1:9000".to_string()
}

fn default_max_clients() -> usize {
    30
}

fn default_backlog() -> u32 {
    1024
}

fn default_accept_backoff_ms() -> u64 {
    50
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_max_line_length() -> usize {
    8 * 1024
}

fn default_write_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_name() -> String {
    "dodo".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What the process was asked to do.
#[derive(Debug, Clone)]
pub enum Mode {
    Serve,
    Connect(Endpoint),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: Endpoint,
    pub workers: Option<usize>,
    pub max_clients: usize,
    pub backlog: u32,
    pub accept_backoff: Duration,
    pub session: SessionSettings,
    pub relay: RelayPolicy,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<(Mode, Self), ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge parsed CLI args over a TOML config.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<(Mode, Self), ConfigError> {
        let (mode, listen_override) = match cli.command {
            Command::Serve { listen } => (Mode::Serve, listen),
            Command::Connect { addr } => (Mode::Connect(addr), None),
        };

        let mut config = Self::from_toml(toml_config)?;
        if let Some(listen) = listen_override {
            config.listen = listen;
        }
        if cli.workers.is_some() {
            config.workers = cli.workers;
        }
        if cli.log_level != "info" {
            config.log_level = cli.log_level;
        }

        Ok((mode, config))
    }

    /// Resolve a TOML config on its own, without CLI overrides.
    pub fn from_toml(toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            session,
            relay,
            logging,
        } = toml_config;

        let listen = server
            .listen
            .parse()
            .map_err(|e| ConfigError::InvalidListen(server.listen.clone(), e))?;

        Ok(Config {
            listen,
            workers: server.workers,
            max_clients: server.max_clients,
            backlog: server.backlog,
            accept_backoff: Duration::from_millis(server.accept_backoff_ms),
            session: SessionSettings {
                outbound_capacity: session.outbound_capacity.max(1),
                overflow: session.overflow,
                max_line_length: session.max_line_length,
                idle_timeout: nonzero_secs(session.idle_timeout),
                write_timeout: nonzero_secs(session.write_timeout),
            },
            relay: RelayPolicy {
                echo_to_sender: relay.echo_to_sender,
                identity: relay.identity,
                default_name: relay.default_name,
                announce: relay.announce,
                allow_rename: relay.allow_rename,
            },
            log_level: logging.level,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: Endpoint::Tcp(SocketAddr::from(([127, 0, 0, 1], 9000))),
            workers: None,
            max_clients: default_max_clients(),
            backlog: default_backlog(),
            accept_backoff: Duration::from_millis(default_accept_backoff_ms()),
            session: SessionSettings::default(),
            relay: RelayPolicy::default(),
            log_level: default_log_level(),
        }
    }
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid listen address '{0}': {1}")]
    InvalidListen(String, #[source] AddrParseError),
}
