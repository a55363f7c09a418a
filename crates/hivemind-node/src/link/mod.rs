//! Direct peer-to-peer links.
//!
//! A [`LinkTransport`] opens one [`LinkNegotiator`] per remote peer. The
//! negotiator produces and consumes the opaque offer/answer/candidate values
//! that travel through the relay, and reports progress on a [`LinkEvent`]
//! channel. Once the link is usable it hands over a [`LinkChannel`] for
//! message traffic.

pub mod memory;
pub mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

use async_trait::async_trait;
use hivemind_protocol::PeerId;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Link transport errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Channel is not open
    #[error("link closed")]
    Closed,

    /// Offer, answer or candidate could not be used
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// Remote description did not have the expected shape
    #[error("invalid {0}")]
    InvalidDescription(&'static str),

    /// Socket error
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err.to_string())
    }
}

/// Progress reported by a negotiator
pub enum LinkEvent {
    /// A local candidate to forward to the remote peer
    LocalCandidate(Value),
    /// The channel is open
    Ready(Arc<dyn LinkChannel>),
    /// One message arrived on the channel
    Message(String),
    /// The channel closed
    Closed,
    /// The link failed before or after opening
    Failed(String),
}

impl std::fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            LinkEvent::Ready(_) => f.write_str("Ready"),
            LinkEvent::Message(m) => f.debug_tuple("Message").field(m).finish(),
            LinkEvent::Closed => f.write_str("Closed"),
            LinkEvent::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

/// Sender half of a negotiator's event stream
pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// Factory for direct links
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Transport name for logging
    fn name(&self) -> &'static str;

    /// Start a link from `local` to `remote`
    ///
    /// All asynchronous progress for this link is reported on `events`.
    async fn open(
        &self,
        local: &PeerId,
        remote: &PeerId,
        events: LinkEventSender,
    ) -> Result<Box<dyn LinkNegotiator>, LinkError>;
}

/// Offer/answer negotiation for one link
#[async_trait]
pub trait LinkNegotiator: Send {
    /// Produce the initiator's offer
    async fn create_offer(&mut self) -> Result<Value, LinkError>;

    /// Apply a remote offer and produce the answer
    async fn accept_offer(&mut self, offer: Value) -> Result<Value, LinkError>;

    /// Apply the remote answer
    async fn accept_answer(&mut self, answer: Value) -> Result<(), LinkError>;

    /// Apply a remote candidate
    async fn add_candidate(&mut self, candidate: Value) -> Result<(), LinkError>;

    /// Abandon negotiation and release resources
    async fn close(&mut self);
}

/// An open message channel to a remote peer
pub trait LinkChannel: Send + Sync {
    /// Queue one message for delivery
    ///
    /// # Errors
    ///
    /// Returns `LinkError::Closed` if the channel is not open.
    fn send(&self, message: String) -> Result<(), LinkError>;

    /// Whether the channel is still open
    fn is_open(&self) -> bool;

    /// Close the channel; both ends observe [`LinkEvent::Closed`]
    fn close(&self);
}

/// Extract a string field from an opaque description
pub(crate) fn field<'a>(
    value: &'a Value,
    name: &str,
    kind: &'static str,
) -> Result<&'a str, LinkError> {
    value
        .get(name)
        .and_then(Value::as_str)
        .ok_or(LinkError::InvalidDescription(kind))
}

/// Random token binding an offer to the link it opens
pub(crate) fn offer_token() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().r#gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
