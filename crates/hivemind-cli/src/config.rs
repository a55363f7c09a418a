//! Configuration system for the Hivemind CLI.

use hivemind_node::{LinkConfig, NodeConfig as NodeSettings};
use hivemind_relay::{RelayServerConfig, SignalingConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hivemind configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Relay server configuration
    #[serde(default)]
    pub relay: RelayConfig,
    /// Swarm node configuration
    #[serde(default)]
    pub node: NodeConfig,
    /// Direct-link configuration
    #[serde(default)]
    pub link: LinkSettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Listen address
    #[serde(default = "default_relay_listen_addr")]
    pub listen_addr: String,
    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Signals forwarded per connection per second
    #[serde(default = "default_signal_rate_limit")]
    pub signal_rate_limit: usize,
}

/// Swarm node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Relay WebSocket URL
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Application ping interval in seconds
    #[serde(default = "default_ping_secs")]
    pub ping_interval_secs: u64,
    /// Dispatch timeout in seconds
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
    /// Negotiation timeout in seconds
    #[serde(default = "default_negotiation_timeout_secs")]
    pub negotiation_timeout_secs: u64,
}

/// Direct-link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    /// TCP transport listen address
    #[serde(default = "default_link_listen_addr")]
    pub listen_addr: String,
    /// Link handshake timeout in seconds
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// STUN/TURN servers
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_relay_listen_addr() -> String {
    format!("0.0.0.0:{}", hivemind_protocol::DEFAULT_RELAY_PORT)
}

fn default_heartbeat_secs() -> u64 {
    hivemind_relay::HEARTBEAT_INTERVAL.as_secs()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_signal_rate_limit() -> usize {
    100
}

fn default_relay_url() -> String {
    format!("ws://127.0.0.1:{}", hivemind_protocol::DEFAULT_RELAY_PORT)
}

fn default_ping_secs() -> u64 {
    hivemind_relay::CLIENT_PING_INTERVAL.as_secs()
}

fn default_dispatch_timeout_secs() -> u64 {
    hivemind_node::config::DEFAULT_DISPATCH_TIMEOUT.as_secs()
}

fn default_negotiation_timeout_secs() -> u64 {
    hivemind_node::config::DEFAULT_NEGOTIATION_TIMEOUT.as_secs()
}

fn default_link_listen_addr() -> String {
    "0.0.0.0:0".to_string()
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_ice_servers() -> Vec<String> {
    hivemind_node::config::DEFAULT_ICE_SERVERS
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_relay_listen_addr(),
            heartbeat_interval_secs: default_heartbeat_secs(),
            max_connections: default_max_connections(),
            signal_rate_limit: default_signal_rate_limit(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            ping_interval_secs: default_ping_secs(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
            negotiation_timeout_secs: default_negotiation_timeout_secs(),
        }
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_link_listen_addr(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            ice_servers: default_ice_servers(),
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

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("hivemind/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse the relay listen address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn relay_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.relay.listen_addr.parse()?)
    }

    /// Parse the direct-link listen address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn link_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.link.listen_addr.parse()?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.relay_listen_addr()?;
        self.link_listen_addr()?;

        // Relay URL must be a WebSocket URL
        let url = url::Url::parse(&self.node.relay_url)
            .map_err(|e| anyhow::anyhow!("Invalid relay URL '{}': {}", self.node.relay_url, e))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            anyhow::bail!(
                "Relay URL '{}' must use ws:// or wss://",
                self.node.relay_url
            );
        }

        for server in &self.link.ice_servers {
            let scheme = server.split(':').next().unwrap_or_default();
            if !matches!(scheme, "stun" | "turn" | "turns") || server.len() <= scheme.len() + 1 {
                anyhow::bail!("ICE server '{server}' must be a stun:, turn: or turns: URL");
            }
        }

        validate_secs("Heartbeat interval", self.relay.heartbeat_interval_secs, 3600)?;
        validate_secs("Ping interval", self.node.ping_interval_secs, 3600)?;
        validate_secs("Dispatch timeout", self.node.dispatch_timeout_secs, 3600)?;
        validate_secs(
            "Negotiation timeout",
            self.node.negotiation_timeout_secs,
            3600,
        )?;
        validate_secs("Handshake timeout", self.link.handshake_timeout_secs, 300)?;

        if self.relay.max_connections == 0 || self.relay.max_connections > 1_000_000 {
            anyhow::bail!("Max connections must be between 1 and 1000000");
        }
        if self.relay.signal_rate_limit == 0 {
            anyhow::bail!("Signal rate limit must be non-zero");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Relay server settings
    #[must_use]
    pub fn relay_server_config(&self) -> RelayServerConfig {
        RelayServerConfig {
            max_connections: self.relay.max_connections,
            signal_rate_limit: self.relay.signal_rate_limit,
            heartbeat_interval: Duration::from_secs(self.relay.heartbeat_interval_secs),
            ..RelayServerConfig::default()
        }
    }

    /// Node settings
    ///
    /// # Errors
    ///
    /// Returns an error if the link listen address cannot be parsed.
    pub fn node_config(&self) -> anyhow::Result<NodeSettings> {
        let mut signaling = SignalingConfig::new(self.node.relay_url.clone());
        signaling.ping_interval = Duration::from_secs(self.node.ping_interval_secs);

        Ok(NodeSettings {
            signaling,
            dispatch_timeout: Duration::from_secs(self.node.dispatch_timeout_secs),
            negotiation_timeout: Duration::from_secs(self.node.negotiation_timeout_secs),
            link: LinkConfig {
                ice_servers: self.link.ice_servers.clone(),
                listen_addr: self.link_listen_addr()?,
                handshake_timeout: Duration::from_secs(self.link.handshake_timeout_secs),
            },
        })
    }
}

fn validate_secs(name: &str, value: u64, max: u64) -> anyhow::Result<()> {
    if value == 0 || value > max {
        anyhow::bail!("{name} must be between 1 and {max} seconds");
    }
    Ok(())
}
