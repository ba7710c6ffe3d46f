//! Agent Core: the model/tool orchestration layer.
//!
//! Submodules:
//! - `conversation`: Caller-owned conversation history threaded through runs
//! - `orchestrator`: Bounded model ↔ tool exchange for a single request
//! - `errors`: Agent-level error types

pub mod conversation;
pub mod errors;
pub mod orchestrator;

// Re-exports for convenience
pub use conversation::Conversation;
pub use errors::AgentError;
pub use orchestrator::{Orchestrator, OrchestratorSettings, RunOutcome};
