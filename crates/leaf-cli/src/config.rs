//! Configuration file for the Relay Leaf CLI.

use leaf_core::{ClientConfig, ProxySelection, RetryConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Relay client settings
    #[serde(default)]
    pub client: ClientSection,
    /// Connection timing
    #[serde(default)]
    pub connection: ConnectionSection,
    /// Reconnection backoff
    #[serde(default)]
    pub retry: RetryConfig,
    /// Stats output
    #[serde(default)]
    pub output: OutputSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay client settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientSection {
    /// Discovery endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery_url: Option<String>,
    /// Partner identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partner_id: Option<String>,
    /// Proxy URLs in preference order
    #[serde(default)]
    pub proxies: Vec<String>,
    /// Fixed device identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Fallback relay nodes (`host:port`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_nodes: Option<Vec<String>>,
    /// Proxy selection policy
    #[serde(default)]
    pub proxy_selection: ProxySelection,
}

/// Connection timing, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSection {
    /// TCP connect / tunnel timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Discovery fetch timeout
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_secs: u64,
    /// Time between discovery rounds
    #[serde(default = "default_rediscovery_interval")]
    pub rediscovery_interval_secs: u64,
    /// Time between keepalive pings
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    /// Silence before a Session is closed
    #[serde(default = "default_dead_after")]
    pub dead_after_secs: u64,
}

/// Stats output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSection {
    /// Seconds between stats lines
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_connect_timeout() -> u64 {
    10
}

fn default_discovery_timeout() -> u64 {
    10
}

fn default_rediscovery_interval() -> u64 {
    300
}

fn default_keepalive() -> u64 {
    15
}

fn default_dead_after() -> u64 {
    60
}

fn default_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            discovery_timeout_secs: default_discovery_timeout(),
            rediscovery_interval_secs: default_rediscovery_interval(),
            keepalive_secs: default_keepalive(),
            dead_after_secs: default_dead_after(),
        }
    }
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("relay-leaf/config.toml")
    }

    /// Load the file at `path`, or defaults when no path was given and the
    /// default file does not exist
    ///
    /// # Errors
    ///
    /// Returns an error if an existing or explicitly named file cannot be
    /// loaded.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Build the library configuration
    ///
    /// Degraded detection kicks in at half the dead-after period.
    #[must_use]
    pub fn to_client_config(&self, verbose: bool) -> ClientConfig {
        let dead_after = Duration::from_secs(self.connection.dead_after_secs);
        ClientConfig {
            discovery_url: self.client.discovery_url.clone(),
            partner_id: self.client.partner_id.clone(),
            proxies: self.client.proxies.clone(),
            verbose,
            device_id: self.client.device_id.clone(),
            default_nodes: self.client.default_nodes.clone(),
            retry: self.retry.clone(),
            proxy_selection: self.client.proxy_selection,
            connect_timeout: Duration::from_secs(self.connection.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(self.connection.connect_timeout_secs),
            discovery_timeout: Duration::from_secs(self.connection.discovery_timeout_secs),
            rediscovery_interval: Duration::from_secs(self.connection.rediscovery_interval_secs),
            keepalive_interval: Duration::from_secs(self.connection.keepalive_secs),
            degraded_after: dead_after / 2,
            dead_after,
            ..ClientConfig::default()
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.output.interval_secs == 0 {
            anyhow::bail!("Stats interval must be at least 1 second");
        }

        self.to_client_config(false).validate()?;
        Ok(())
    }
}
