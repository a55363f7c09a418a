//! Negotiation signals.
//!
//! The relay forwards `signal` payloads verbatim. Nodes interpret them as one
//! of the three negotiation steps below; the inner `offer` / `answer` /
//! `candidate` values belong to the link transport and stay opaque here.

use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One step of direct-link negotiation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NegotiationSignal {
    /// Session description from the initiator
    Offer {
        /// Transport-specific offer
        offer: Value,
    },
    /// Session description from the responder
    Answer {
        /// Transport-specific answer
        answer: Value,
    },
    /// Connectivity candidate, may arrive at any point during negotiation
    IceCandidate {
        /// Transport-specific candidate
        candidate: Value,
    },
}

impl NegotiationSignal {
    /// Interpret a relay `signal` payload
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Malformed` if the payload is not a known signal.
    pub fn from_payload(payload: &Value) -> Result<Self, CodecError> {
        Ok(Self::deserialize(payload)?)
    }

    /// Convert into a relay `signal` payload
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    pub fn to_payload(&self) -> Result<Value, CodecError> {
        serde_json::to_value(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Get the wire type name
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            NegotiationSignal::Offer { .. } => "offer",
            NegotiationSignal::Answer { .. } => "answer",
            NegotiationSignal::IceCandidate { .. } => "ice-candidate",
        }
    }

    /// Whether this signal may open a session for an unknown remote peer
    #[must_use]
    pub fn is_offer(&self) -> bool {
        matches!(self, NegotiationSignal::Offer { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_candidate() {
        let payload = json!({
            "type": "ice-candidate",
            "candidate": {"candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54400 typ host"}
        });
        let signal = NegotiationSignal::from_payload(&payload).unwrap();

        assert_eq!(signal.kind(), "ice-candidate");
        assert!(!signal.is_offer());
    }

    #[test]
    fn test_offer_payload_shape() {
        let signal = NegotiationSignal::Offer {
            offer: json!({"type": "offer", "sdp": "v=0"}),
        };
        let payload = signal.to_payload().unwrap();

        assert_eq!(payload["type"], "offer");
        assert_eq!(payload["offer"]["sdp"], "v=0");
        assert!(signal.is_offer());
    }

    #[test]
    fn test_unknown_signal_rejected() {
        assert!(NegotiationSignal::from_payload(&json!({"type": "renegotiate"})).is_err());
        assert!(NegotiationSignal::from_payload(&json!("offer")).is_err());
        assert!(NegotiationSignal::from_payload(&json!({"type": "answer"})).is_err());
    }
}
