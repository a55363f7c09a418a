//! Codec error types.

use thiserror::Error;

/// Errors produced while encoding, decoding or validating wire messages.
///
/// None of these are fatal: a receiver that hits one drops the offending
/// message and keeps the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Message exceeds [`crate::MAX_MESSAGE_SIZE`]
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge {
        /// Size of the rejected message
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Not a JSON object of a known message type
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Known message type with an invalid field
    #[error("invalid {kind} message: {reason}")]
    Invalid {
        /// Message type name
        kind: &'static str,
        /// What was wrong
        reason: &'static str,
    },

    /// Message type that is not accepted in this direction
    #[error("unexpected {0} message for this direction")]
    UnexpectedDirection(&'static str),

    /// Payload is not valid base64
    #[error("invalid payload encoding: {0}")]
    Payload(String),

    /// Serialization failed
    #[error("encoding failed: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Malformed(err.to_string())
    }
}

impl From<base64::DecodeError> for CodecError {
    fn from(err: base64::DecodeError) -> Self {
        CodecError::Payload(err.to_string())
    }
}

/// Reject messages larger than the protocol maximum before parsing them.
pub(crate) fn check_size(raw: &str) -> Result<(), CodecError> {
    if raw.len() > crate::MAX_MESSAGE_SIZE {
        return Err(CodecError::TooLarge {
            size: raw.len(),
            max: crate::MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}
