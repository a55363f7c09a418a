//! Peer session state machine.
//!
//! A [`PeerSession`] tracks negotiation of the direct link to one remote
//! peer. It holds no I/O: the session driver feeds it signals and link
//! events and acts on the transitions it allows.

use crate::error::SessionError;
use hivemind_protocol::PeerId;
use serde_json::Value;
use std::time::Instant;

/// Which side of the negotiation this node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the offer (the newer member of the swarm)
    Initiator,
    /// Answers an offer
    Responder,
}

/// Negotiation sub-states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Initiator: offer sent, awaiting answer
    OfferSent,
    /// Initiator: answer applied, awaiting channel
    AnswerReceived,
    /// Responder: answer sent, awaiting channel
    AnswerSent,
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing exchanged yet
    New,
    /// Offer/answer exchange in progress
    Negotiating(NegotiationPhase),
    /// Channel open, tasks may flow
    Connected,
    /// Terminal
    Closed,
}

impl SessionState {
    /// Whether the session reached its terminal state
    #[must_use]
    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }
}

/// Negotiation state for one remote peer
#[derive(Debug)]
pub struct PeerSession {
    remote: PeerId,
    role: Role,
    state: SessionState,
    created_at: Instant,
    connected_at: Option<Instant>,
    remote_description_applied: bool,
    pending_candidates: Vec<Value>,
}

impl PeerSession {
    /// Create a session that will send the offer
    #[must_use]
    pub fn new_initiator(remote: PeerId) -> Self {
        Self::new(remote, Role::Initiator)
    }

    /// Create a session that waits for an offer
    #[must_use]
    pub fn new_responder(remote: PeerId) -> Self {
        Self::new(remote, Role::Responder)
    }

    /// Create a session in the `New` state
    #[must_use]
    pub fn new(remote: PeerId, role: Role) -> Self {
        Self {
            remote,
            role,
            state: SessionState::New,
            created_at: Instant::now(),
            connected_at: None,
            remote_description_applied: false,
            pending_candidates: Vec::new(),
        }
    }

    /// Remote peer id
    #[must_use]
    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    /// Negotiation role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// When the session was created
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the channel opened, if it has
    #[must_use]
    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at
    }

    /// Whether a transition to `to` is allowed from the current state
    #[must_use]
    pub fn can_transition(&self, to: SessionState) -> bool {
        use NegotiationPhase::{AnswerReceived, AnswerSent, OfferSent};
        use SessionState::{Closed, Connected, Negotiating, New};

        match (self.state, to) {
            // From New
            (New, Negotiating(OfferSent) | Negotiating(AnswerSent) | Closed) => true,

            // From Negotiating
            (Negotiating(OfferSent), Negotiating(AnswerReceived) | Connected | Closed) => true,
            (Negotiating(AnswerReceived | AnswerSent), Connected | Closed) => true,

            // From Connected
            (Connected, Closed) => true,

            // Closed is terminal
            _ => false,
        }
    }

    /// Transition to a new state
    ///
    /// Returns the previous state.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the transition is not allowed.
    pub fn transition_to(&mut self, to: SessionState) -> Result<SessionState, SessionError> {
        if !self.can_transition(to) {
            return Err(SessionError {
                from: self.state,
                to,
            });
        }

        let from = self.state;
        self.state = to;

        match to {
            SessionState::Connected => {
                self.connected_at = Some(Instant::now());
            }
            SessionState::Closed => {
                self.pending_candidates.clear();
            }
            _ => {}
        }

        tracing::debug!(remote = %self.remote, ?from, ?to, "session state transition");
        Ok(from)
    }

    /// Record that the remote description was applied
    ///
    /// Returns the candidates buffered until now, in arrival order.
    pub fn remote_description_applied(&mut self) -> Vec<Value> {
        self.remote_description_applied = true;
        std::mem::take(&mut self.pending_candidates)
    }

    /// Accept a remote candidate
    ///
    /// Returns the candidate if it can be applied now, or `None` if it was
    /// buffered (or the session is closed).
    pub fn accept_candidate(&mut self, candidate: Value) -> Option<Value> {
        if self.state.is_closed() {
            return None;
        }
        if self.remote_description_applied {
            Some(candidate)
        } else {
            self.pending_candidates.push(candidate);
            None
        }
    }

    /// Number of candidates waiting for the remote description
    #[must_use]
    pub fn buffered_candidates(&self) -> usize {
        self.pending_candidates.len()
    }
}
