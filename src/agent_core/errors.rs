//! Agent Core error types.

use thiserror::Error;

use crate::inference::InferenceError;

/// Errors that abort an orchestration run.
///
/// Tool lookup misses and tool failures are not here: they become notes in
/// the reply and error-flagged tool results for the model.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A query arrived while no peer is connected.
    #[error("no active MCP connections")]
    NoConnections,

    /// The model request failed.
    #[error("model call failed: {source}")]
    Inference {
        #[from]
        source: InferenceError,
    },

    /// The model did not answer within the orchestrator's deadline.
    #[error("model did not respond within {timeout_secs}s")]
    ModelTimeout { timeout_secs: u64 },
}
