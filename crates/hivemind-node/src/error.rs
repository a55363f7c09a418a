//! Error types for the node
//!
//! Errors are split by caller: [`NodeError`] for lifecycle and session
//! operations, [`DispatchError`] for the outcome of a single dispatch, and
//! [`SessionError`] for rejected state transitions.
//!
//! # Example
//!
//! ```no_run
//! use hivemind_node::NodeError;
//!
//! fn handle_error(err: NodeError) {
//!     if err.is_transient() {
//!         println!("Transient error, may retry: {err}");
//!     } else {
//!         println!("Permanent error: {err}");
//!     }
//! }
//! ```

use crate::session::SessionState;
use hivemind_protocol::{CodecError, PeerId, TaskId};
use hivemind_relay::RelayError;
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in node operations
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    // ============ Signaling Errors ============
    /// Could not reach or talk to the relay
    #[error("Signaling error: {0}")]
    Signaling(Cow<'static, str>),

    // ============ Link Errors ============
    /// Direct-link transport failure
    #[error("Link error: {0}")]
    Link(Cow<'static, str>),

    /// Negotiation with a remote peer failed
    #[error("Negotiation failed: {0}")]
    Negotiation(Cow<'static, str>),

    // ============ Session Errors ============
    /// No session exists for the peer
    #[error("Session not found for peer {0}")]
    SessionNotFound(PeerId),

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    // ============ Operational Errors ============
    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Channel send/receive error
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Signaling(_)
                | NodeError::Link(_)
                | NodeError::Timeout(_)
                | NodeError::Channel(_)
        )
    }

    /// Returns true if this error will not succeed without intervention
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NodeError::InvalidConfig(_)
                | NodeError::SessionNotFound(_)
                | NodeError::InvalidState(_)
                | NodeError::Serialization(_)
        )
    }

    /// Create a negotiation error with static context (zero allocation)
    #[must_use]
    pub const fn negotiation(context: &'static str) -> Self {
        NodeError::Negotiation(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NodeError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a channel error with static context (zero allocation)
    #[must_use]
    pub const fn channel(context: &'static str) -> Self {
        NodeError::Channel(Cow::Borrowed(context))
    }

    /// Create an invalid config error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        NodeError::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<RelayError> for NodeError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Timeout => NodeError::Timeout(Cow::Borrowed("relay connection")),
            RelayError::InvalidUrl(url) => NodeError::InvalidConfig(Cow::Owned(url)),
            other => NodeError::Signaling(Cow::Owned(other.to_string())),
        }
    }
}

impl From<CodecError> for NodeError {
    fn from(err: CodecError) -> Self {
        NodeError::Serialization(Cow::Owned(err.to_string()))
    }
}

impl From<crate::link::LinkError> for NodeError {
    fn from(err: crate::link::LinkError) -> Self {
        NodeError::Link(Cow::Owned(err.to_string()))
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Link(Cow::Owned(err.to_string()))
    }
}

/// Outcome of a failed dispatch
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No peer has an open channel
    #[error("No peers available")]
    NoPeers,

    /// The task could not be written to the chosen peer's channel
    #[error("Failed to send task to {peer}: {reason}")]
    SendFailed {
        /// Peer the task was sent to
        peer: PeerId,
        /// Transport failure description
        reason: String,
    },

    /// No result arrived in time
    #[error("Task {task_id} timed out after {timeout:?}")]
    Timeout {
        /// Task that expired
        task_id: TaskId,
        /// Configured dispatch timeout
        timeout: Duration,
    },

    /// The task message could not be encoded
    #[error("Failed to encode task: {0}")]
    Codec(CodecError),
}

/// Rejected session state transition
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Invalid session transition {from:?} -> {to:?}")]
pub struct SessionError {
    /// State the session was in
    pub from: SessionState,
    /// State that was requested
    pub to: SessionState,
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;
