//! Inference Client: language-model access for the orchestration loop.
//!
//! This module handles all communication with the model endpoint:
//! - The [`LanguageModel`] trait the orchestrator depends on
//! - An Anthropic Messages API implementation over `reqwest`
//! - Conversation and content-part types shared with the agent core
//! - Model configuration (`model` section of `config.yaml`)

pub mod client;
pub mod config;
pub mod errors;
pub mod types;

// Re-exports for convenience
pub use client::{AnthropicClient, LanguageModel};
pub use config::ModelConfig;
pub use errors::InferenceError;
pub use types::{ContentPart, ModelResponse, Role, ToolSpec, Turn, TurnContent};
