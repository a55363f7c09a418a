//! # Hivemind Protocol
//!
//! Wire messages exchanged by Hivemind nodes and the signaling relay.
//!
//! This crate provides:
//! - Relay envelopes (`register`, `peers`, `peer-joined`, `peer-left`,
//!   `signal`, `ping`, `pong`)
//! - Negotiation signals carried opaquely inside `signal` envelopes
//!   (`offer`, `answer`, `ice-candidate`)
//! - Peer-link messages (`task`, `result`) exchanged over direct channels
//! - Peer and task identifiers
//!
//! Every message is a single JSON object with a `type` tag. Decoding never
//! panics: malformed input yields a [`CodecError`] which callers log and drop.
//!
//! ## Example
//!
//! ```rust
//! use hivemind_protocol::{Direction, Envelope, PeerId};
//!
//! let raw = r#"{"type":"register","peerId":"peer-abc123xyz"}"#;
//! let envelope = Envelope::decode(raw).unwrap();
//! envelope.validate(Direction::ToRelay).unwrap();
//!
//! assert_eq!(envelope, Envelope::register(PeerId::new("peer-abc123xyz")));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod envelope;
pub mod error;
pub mod ids;
pub mod peer;
pub mod signal;

pub use envelope::{Direction, Envelope};
pub use error::CodecError;
pub use ids::{PeerId, TaskId};
pub use peer::{PeerMessage, ResultMessage, TaskMessage, TaskResult};
pub use signal::NegotiationSignal;

/// Default relay listening port
pub const DEFAULT_RELAY_PORT: u16 = 3000;

/// Maximum size of a single encoded message (64 KB)
pub const MAX_MESSAGE_SIZE: usize = 65536;
