//! Relay error types.

use hivemind_protocol::CodecError;
use thiserror::Error;

/// Errors raised by the relay server and the signaling client
#[derive(Debug, Error)]
pub enum RelayError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Message could not be encoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Relay URL is not a usable WebSocket URL
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    /// Connection or handshake timed out
    #[error("Connection timeout")]
    Timeout,

    /// Client is not connected to a relay
    #[error("Not connected to relay")]
    NotConnected,

    /// Server has been shut down
    #[error("Relay server is shut down")]
    Shutdown,
}

impl RelayError {
    /// Whether the failure may clear up on a later attempt
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::Io(_) | RelayError::WebSocket(_) | RelayError::Timeout | RelayError::NotConnected
        )
    }
}

impl From<url::ParseError> for RelayError {
    fn from(err: url::ParseError) -> Self {
        RelayError::InvalidUrl(err.to_string())
    }
}
