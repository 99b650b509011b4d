//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - TOML configuration file (`--config`, or the first default path found)
//! - Environment variables (`CABLE__*`, `__` separating sections)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tenvis_cable_core::ServerConfig;

/// Paths searched when no config file is given.
const DEFAULT_PATHS: [&str; 3] = [
    "cable.toml",
    "/etc/cable/cable.toml",
    "~/.config/cable/cable.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Connection and channel behaviour.
    #[serde(default)]
    pub cable: CableConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path of the WebSocket endpoint.
    #[serde(default = "default_path")]
    pub path: String,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of open connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Cable behaviour, handed to the core server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CableConfig {
    /// Number of worker tasks.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Interval between pings in milliseconds, 0 to disable.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Refuse connections without an identity.
    #[serde(default)]
    pub require_identity: bool,

    /// Accepted `Origin` values. Empty accepts any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_path() -> String {
    "/cable".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_connections() -> usize {
    100_000
}

fn default_worker_pool_size() -> usize {
    ServerConfig::default().worker_pool_size
}

fn default_heartbeat_interval() -> u64 {
    3_000 // 3 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            cable: CableConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

impl Default for CableConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            require_identity: false,
            allowed_origins: Vec::new(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from a file, the default paths, and the environment.
    ///
    /// An explicit `path` must exist. Default paths are skipped when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if a config source cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                let expanded = expand(path);
                anyhow::ensure!(
                    expanded.exists(),
                    "Config file not found: {}",
                    expanded.display()
                );
                Some(expanded)
            }
            None => DEFAULT_PATHS
                .iter()
                .map(|path| expand(Path::new(path)))
                .find(|path| path.exists()),
        };

        let mut builder = config::Config::builder();
        if let Some(file) = &file {
            tracing::debug!(path = %file.display(), "Loading config file");
            builder = builder.add_source(
                config::File::from(file.as_path()).format(config::FileFormat::Toml),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("CABLE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("cable.allowed_origins"),
            )
            .build()
            .context("Failed to assemble configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Load configuration from a specific TOML file only.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Core server settings.
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        let heartbeat = self.cable.heartbeat_interval_ms;
        ServerConfig {
            worker_pool_size: self.cable.worker_pool_size.max(1),
            heartbeat_interval: (heartbeat > 0).then(|| Duration::from_millis(heartbeat)),
            require_identity: self.cable.require_identity,
            allowed_origins: self.cable.allowed_origins.clone(),
        }
    }
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}
