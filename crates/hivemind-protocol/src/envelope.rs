//! Relay envelope definitions.

use crate::error::{CodecError, check_size};
use crate::ids::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Direction an envelope travels relative to the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to relay
    ToRelay,
    /// Relay to client
    FromRelay,
}

/// Messages exchanged between a node and the signaling relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// Client binds its connection to a peer id
    Register {
        /// Identity being registered
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },

    /// Relay sends the current membership snapshot (excluding the receiver)
    Peers {
        /// Other registered peers
        peers: Vec<PeerId>,
    },

    /// Relay announces a newly registered peer
    PeerJoined {
        /// Peer that joined
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },

    /// Relay announces a peer that went away
    PeerLeft {
        /// Peer that left
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },

    /// Opaque negotiation payload routed through the relay
    Signal {
        /// Destination (client to relay)
        #[serde(
            rename = "targetPeerId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        target_peer_id: Option<PeerId>,
        /// Origin (relay to client)
        #[serde(
            rename = "fromPeerId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        from_peer_id: Option<PeerId>,
        /// Negotiation data, never inspected by the relay
        signal: Value,
    },

    /// Application-level liveness request
    Ping,

    /// Application-level liveness reply
    Pong,
}

impl Envelope {
    /// Build a `register` envelope
    #[must_use]
    pub fn register(peer_id: PeerId) -> Self {
        Envelope::Register { peer_id }
    }

    /// Build a client-side `signal` addressed to `target`
    #[must_use]
    pub fn signal_to(target: PeerId, signal: Value) -> Self {
        Envelope::Signal {
            target_peer_id: Some(target),
            from_peer_id: None,
            signal,
        }
    }

    /// Build a relay-side `signal` stamped with its origin
    #[must_use]
    pub fn signal_from(from: PeerId, signal: Value) -> Self {
        Envelope::Signal {
            target_peer_id: None,
            from_peer_id: Some(from),
            signal,
        }
    }

    /// Serialize to a single JSON text message
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Parse a single JSON text message
    ///
    /// # Errors
    ///
    /// Returns `CodecError` if the message is oversized, not JSON, or not a
    /// known envelope type.
    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        check_size(raw)?;
        Ok(serde_json::from_str(raw)?)
    }

    /// Check that the envelope is well-formed for the direction it arrived on
    ///
    /// # Errors
    ///
    /// Returns `CodecError::UnexpectedDirection` for message types that never
    /// travel this way and `CodecError::Invalid` for missing identifiers.
    pub fn validate(&self, direction: Direction) -> Result<(), CodecError> {
        match (direction, self) {
            (Direction::ToRelay, Envelope::Register { peer_id }) => {
                if peer_id.is_empty() {
                    return Err(CodecError::Invalid {
                        kind: "register",
                        reason: "empty peerId",
                    });
                }
                Ok(())
            }
            (Direction::ToRelay, Envelope::Signal { target_peer_id, .. }) => {
                match target_peer_id {
                    Some(target) if !target.is_empty() => Ok(()),
                    _ => Err(CodecError::Invalid {
                        kind: "signal",
                        reason: "missing targetPeerId",
                    }),
                }
            }
            (Direction::ToRelay, Envelope::Ping) => Ok(()),
            (Direction::FromRelay, Envelope::Signal { from_peer_id, .. }) => match from_peer_id {
                Some(from) if !from.is_empty() => Ok(()),
                _ => Err(CodecError::Invalid {
                    kind: "signal",
                    reason: "missing fromPeerId",
                }),
            },
            (
                Direction::FromRelay,
                Envelope::Peers { .. }
                | Envelope::PeerJoined { .. }
                | Envelope::PeerLeft { .. }
                | Envelope::Pong,
            ) => Ok(()),
            (_, other) => Err(CodecError::UnexpectedDirection(other.message_type())),
        }
    }

    /// Get the wire type name
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Envelope::Register { .. } => "register",
            Envelope::Peers { .. } => "peers",
            Envelope::PeerJoined { .. } => "peer-joined",
            Envelope::PeerLeft { .. } => "peer-left",
            Envelope::Signal { .. } => "signal",
            Envelope::Ping => "ping",
            Envelope::Pong => "pong",
        }
    }
}
