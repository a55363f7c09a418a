//! Compute workers.
//!
//! A [`ComputeWorker`] turns a task payload into result bytes. Errors are
//! reported back to the dispatching peer as a failed result, never as a
//! transport error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Worker failure, sent back as the result's error text
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Payload could not be interpreted
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Computation failed
    #[error("computation failed: {0}")]
    Failed(String),
}

/// Executes tasks received from peers
#[async_trait]
pub trait ComputeWorker: Send + Sync {
    /// Compute the result for one task payload
    async fn process(&self, input: Vec<u8>) -> Result<Vec<u8>, WorkerError>;
}

/// Returns its input unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoWorker;

#[async_trait]
impl ComputeWorker for EchoWorker {
    async fn process(&self, input: Vec<u8>) -> Result<Vec<u8>, WorkerError> {
        Ok(input)
    }
}

/// Input for one dense layer evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayerRequest {
    /// Input activations
    pub input: Vec<f32>,
    /// Row-major weight matrix, one row of `input.len()` per output
    pub weights: Vec<f32>,
    /// One bias per output
    pub bias: Vec<f32>,
}

/// Output of one dense layer evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayerResponse {
    /// `relu(W·x + b)`
    pub output: Vec<f32>,
    /// Index of the largest output
    pub prediction: usize,
}

/// Evaluates a fully connected layer with ReLU activation
///
/// Payloads are JSON [`DenseLayerRequest`]s; results are JSON
/// [`DenseLayerResponse`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseLayerWorker;

impl DenseLayerWorker {
    /// Evaluate one request
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::InvalidInput` if the dimensions do not line up.
    pub fn evaluate(request: &DenseLayerRequest) -> Result<DenseLayerResponse, WorkerError> {
        let inputs = request.input.len();
        if inputs == 0 {
            return Err(WorkerError::InvalidInput("empty input".to_string()));
        }
        if request.weights.is_empty() || request.weights.len() % inputs != 0 {
            return Err(WorkerError::InvalidInput(format!(
                "{} weights do not fit {inputs} inputs",
                request.weights.len()
            )));
        }

        let outputs = request.weights.len() / inputs;
        if request.bias.len() != outputs {
            return Err(WorkerError::InvalidInput(format!(
                "expected {outputs} biases, got {}",
                request.bias.len()
            )));
        }

        let output: Vec<f32> = request
            .weights
            .chunks_exact(inputs)
            .zip(&request.bias)
            .map(|(row, bias)| {
                let sum: f32 = row.iter().zip(&request.input).map(|(w, x)| w * x).sum();
                (sum + bias).max(0.0)
            })
            .collect();

        if output.iter().any(|v| !v.is_finite()) {
            return Err(WorkerError::Failed("non-finite activation".to_string()));
        }

        let prediction = output
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
            .0;

        Ok(DenseLayerResponse { output, prediction })
    }
}

#[async_trait]
impl ComputeWorker for DenseLayerWorker {
    async fn process(&self, input: Vec<u8>) -> Result<Vec<u8>, WorkerError> {
        let request: DenseLayerRequest = serde_json::from_slice(&input)
            .map_err(|e| WorkerError::InvalidInput(e.to_string()))?;
        let response = Self::evaluate(&request)?;
        serde_json::to_vec(&response).map_err(|e| WorkerError::Failed(e.to_string()))
    }
}
