//! Node events surfaced to the application.

use hivemind_protocol::{PeerId, TaskId};
use std::fmt;

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed locally (`close_session` or node shutdown)
    LocalClose,
    /// The relay reported the peer left
    PeerLeft,
    /// The direct channel closed
    ChannelClosed,
    /// The link transport failed
    LinkFailed(String),
    /// Offer/answer exchange failed
    NegotiationFailed(String),
    /// Negotiation did not finish in time
    NegotiationTimeout,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::LocalClose => f.write_str("closed locally"),
            DisconnectReason::PeerLeft => f.write_str("peer left"),
            DisconnectReason::ChannelClosed => f.write_str("channel closed"),
            DisconnectReason::LinkFailed(e) => write!(f, "link failed: {e}"),
            DisconnectReason::NegotiationFailed(e) => write!(f, "negotiation failed: {e}"),
            DisconnectReason::NegotiationTimeout => f.write_str("negotiation timed out"),
        }
    }
}

/// Something observable happened on the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A direct channel to the peer opened
    PeerConnected(PeerId),
    /// A connected session ended
    PeerDisconnected {
        /// Remote peer
        peer_id: PeerId,
        /// Cause
        reason: DisconnectReason,
    },
    /// A session ended before its channel opened
    NegotiationFailed {
        /// Remote peer
        peer_id: PeerId,
        /// Cause
        reason: DisconnectReason,
    },
    /// This node computed a task for a peer
    TaskServed {
        /// Requesting peer
        peer_id: PeerId,
        /// Task id
        task_id: TaskId,
        /// Whether the worker succeeded
        success: bool,
    },
    /// A result completed one of this node's dispatches
    ResultReceived {
        /// Computing peer
        peer_id: PeerId,
        /// Task id
        task_id: TaskId,
    },
    /// The relay connection was lost
    RelayDisconnected,
}
