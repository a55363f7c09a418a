//! Node configuration.

use crate::error::NodeError;
use hivemind_relay::SignalingConfig;
use std::net::SocketAddr;
use std::time::Duration;

/// Default ICE servers offered to NAT-traversing transports
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Default dispatch timeout (10 seconds)
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default negotiation timeout (30 seconds)
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Direct-link settings
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// STUN/TURN servers for transports that traverse NATs
    ///
    /// The bundled memory and TCP transports connect directly and do not
    /// consult this list.
    pub ice_servers: Vec<String>,
    /// Listen address for the TCP transport
    pub listen_addr: SocketAddr,
    /// Time allowed for a link handshake
    pub handshake_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(ToString::to_string).collect(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Relay connection settings
    pub signaling: SignalingConfig,
    /// How long a dispatch waits for its result
    pub dispatch_timeout: Duration,
    /// How long a session may take to reach `Connected`
    pub negotiation_timeout: Duration,
    /// Direct-link settings
    pub link: LinkConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            link: LinkConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Configuration pointing at `relay_url` with default timings
    #[must_use]
    pub fn with_relay(relay_url: impl Into<String>) -> Self {
        Self {
            signaling: SignalingConfig::new(relay_url),
            ..Self::default()
        }
    }

    /// Check the configuration before starting a node
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidConfig` for a non-WebSocket relay URL or a
    /// zero interval.
    pub fn validate(&self) -> Result<(), NodeError> {
        self.signaling.parsed_url()?;

        if self.dispatch_timeout.is_zero() {
            return Err(NodeError::invalid_config("dispatch timeout must be non-zero"));
        }
        if self.negotiation_timeout.is_zero() {
            return Err(NodeError::invalid_config(
                "negotiation timeout must be non-zero",
            ));
        }
        if self.signaling.ping_interval.is_zero() {
            return Err(NodeError::invalid_config("ping interval must be non-zero"));
        }
        if self.link.handshake_timeout.is_zero() {
            return Err(NodeError::invalid_config(
                "link handshake timeout must be non-zero",
            ));
        }
        Ok(())
    }
}
