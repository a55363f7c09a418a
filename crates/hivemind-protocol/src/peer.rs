//! Peer-link messages.
//!
//! Once two nodes share a direct channel they exchange `task` requests and
//! `result` replies correlated by [`TaskId`]. Payload bytes travel base64
//! encoded inside the JSON object.

use crate::error::{CodecError, check_size};
use crate::ids::TaskId;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// Outcome of a remote computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    /// Worker produced output bytes
    Success(Vec<u8>),
    /// Worker reported a failure
    Failure(String),
}

impl TaskResult {
    /// Whether the worker succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Success(_))
    }
}

/// Request for remote compute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    /// Correlation id chosen by the dispatcher
    pub task_id: TaskId,
    /// Opaque input for the compute worker
    pub payload: Vec<u8>,
}

/// Reply to a [`TaskMessage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultMessage {
    /// Correlation id copied from the task
    pub task_id: TaskId,
    /// Worker outcome
    pub outcome: TaskResult,
}

/// Message carried over an established peer channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Compute request
    Task(TaskMessage),
    /// Compute reply
    Result(ResultMessage),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum WireMessage {
    Task {
        #[serde(rename = "taskId")]
        task_id: TaskId,
        payload: String,
    },
    Result {
        #[serde(rename = "taskId")]
        task_id: TaskId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl PeerMessage {
    /// Build a task request
    #[must_use]
    pub fn task(task_id: TaskId, payload: Vec<u8>) -> Self {
        PeerMessage::Task(TaskMessage { task_id, payload })
    }

    /// Build a result reply
    #[must_use]
    pub fn result(task_id: TaskId, outcome: TaskResult) -> Self {
        PeerMessage::Result(ResultMessage { task_id, outcome })
    }

    /// Task id this message correlates to
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        match self {
            PeerMessage::Task(t) => &t.task_id,
            PeerMessage::Result(r) => &r.task_id,
        }
    }

    /// Serialize to a single JSON text message
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    pub fn encode(&self) -> Result<String, CodecError> {
        let wire = match self {
            PeerMessage::Task(t) => WireMessage::Task {
                task_id: t.task_id.clone(),
                payload: STANDARD.encode(&t.payload),
            },
            PeerMessage::Result(r) => match &r.outcome {
                TaskResult::Success(bytes) => WireMessage::Result {
                    task_id: r.task_id.clone(),
                    success: true,
                    result: Some(STANDARD.encode(bytes)),
                    error: None,
                },
                TaskResult::Failure(message) => WireMessage::Result {
                    task_id: r.task_id.clone(),
                    success: false,
                    result: None,
                    error: Some(message.clone()),
                },
            },
        };
        serde_json::to_string(&wire).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Parse a single JSON text message
    ///
    /// # Errors
    ///
    /// Returns `CodecError` if the message is oversized, malformed, carries
    /// invalid base64, or is a successful result without output.
    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        check_size(raw)?;
        let wire: WireMessage = serde_json::from_str(raw)?;

        match wire {
            WireMessage::Task { task_id, payload } => Ok(PeerMessage::Task(TaskMessage {
                task_id,
                payload: STANDARD.decode(payload)?,
            })),
            WireMessage::Result {
                task_id,
                success: true,
                result,
                ..
            } => {
                let encoded = result.ok_or(CodecError::Invalid {
                    kind: "result",
                    reason: "success without result",
                })?;
                Ok(PeerMessage::Result(ResultMessage {
                    task_id,
                    outcome: TaskResult::Success(STANDARD.decode(encoded)?),
                }))
            }
            WireMessage::Result {
                task_id,
                success: false,
                error,
                ..
            } => Ok(PeerMessage::Result(ResultMessage {
                task_id,
                outcome: TaskResult::Failure(
                    error.unwrap_or_else(|| "unspecified failure".to_string()),
                ),
            })),
        }
    }
}
