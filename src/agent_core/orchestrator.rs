//! Orchestration loop: one user request → bounded model/tool exchange.
//!
//! 1. **Ask**: the utterance (plus the response hint) is appended as a user
//!    turn and the model is called with the full conversation and catalog.
//! 2. **Dispatch**: the response is walked in order. Text goes to the reply;
//!    each tool-use part is routed through the directory snapshot to its
//!    owning connection and run, one at a time, each consuming one unit of
//!    the per-run budget.
//! 3. **Feed back**: every tool-use part gets a tool result (error-flagged
//!    for misses and failures) and the model is called again.
//!
//! The run ends when a response asks for no tools, or when a response asks
//! for tools after the budget is spent. In the second case the unexecuted
//! parts still get error results, so the returned conversation is a valid
//! prefix for the next run, and the model is not called again.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;

use crate::inference::types::{ContentPart, ModelResponse, ToolSpec, Turn};
use crate::inference::LanguageModel;
use crate::mcp_client::{CallToolResult, DirectorySnapshot, PeerLookup};

use super::conversation::Conversation;
use super::errors::AgentError;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Tool dispatches allowed per run, across all connections.
pub const DEFAULT_MAX_TOOL_CALLS: usize = 4;

/// Appended to every user utterance after a blank line.
pub const DEFAULT_RESPONSE_HINT: &str = "For chat replies, be concise and direct";

pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum characters of a tool result fed back to the model.
pub const MAX_TOOL_RESULT_CHARS: usize = 6_000;

fn url_pattern() -> &'static Regex {
    static URL: OnceLock<Regex> = OnceLock::new();
    URL.get_or_init(|| Regex::new(r"https?://\S+").expect("static URL pattern is valid"))
}

// ─── Types ──────────────────────────────────────────────────────────────────

/// Knobs for one orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub max_tool_calls: usize,
    /// Empty means no hint.
    pub response_hint: String,
    pub model_timeout: Duration,
    pub tool_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_tool_calls: DEFAULT_MAX_TOOL_CALLS,
            response_hint: DEFAULT_RESPONSE_HINT.to_string(),
            model_timeout: DEFAULT_MODEL_TIMEOUT,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }
}

/// What a run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Text parts and notes, joined by newlines.
    pub reply: String,
    /// The prior conversation plus every turn of this run.
    pub conversation: Conversation,
    /// Tool dispatches attempted (hits, misses and failures alike).
    pub tool_calls: usize,
    pub budget_exhausted: bool,
}

/// Result of handling one tool-use part.
enum Dispatch {
    /// No connection owns the tool, or the owner is gone.
    Missing,
    Failed(String),
    Done(CallToolResult),
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

/// Drives the model/tool exchange for a single request at a time.
pub struct Orchestrator {
    model: Arc<dyn LanguageModel>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(model: Arc<dyn LanguageModel>, settings: OrchestratorSettings) -> Self {
        Self { model, settings }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Run one request against `snapshot`, starting from `prior`.
    ///
    /// `prior` is never modified; on error the caller's history is exactly
    /// as it was.
    pub async fn run(
        &self,
        utterance: &str,
        snapshot: &DirectorySnapshot,
        peers: &dyn PeerLookup,
        prior: &Conversation,
    ) -> Result<RunOutcome, AgentError> {
        let tools = tool_specs(snapshot);
        let mut conversation = prior.clone();
        conversation.push(Turn::user_text(self.with_hint(utterance)));

        tracing::info!(
            utterance_len = utterance.len(),
            prior_turns = prior.len(),
            tool_count = tools.len(),
            "orchestrator: run started"
        );

        let mut output: Vec<String> = Vec::new();
        let mut tool_calls = 0usize;
        let mut budget_exhausted = false;

        let mut response = self.call_model(&conversation, &tools).await?;

        loop {
            let parts = response.parts;
            // The Messages API rejects assistant turns with no content.
            if !parts.is_empty() {
                conversation.push(Turn::assistant_parts(parts.clone()));
            }

            let mut results: Vec<ContentPart> = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => output.push(text),
                    ContentPart::ToolUse { id, name, input } => {
                        if tool_calls >= self.settings.max_tool_calls {
                            budget_exhausted = true;
                            results.push(ContentPart::tool_result(
                                &id,
                                format!(
                                    "Not executed: tool call limit ({}) reached",
                                    self.settings.max_tool_calls
                                ),
                                true,
                            ));
                            continue;
                        }
                        tool_calls += 1;
                        let result = self
                            .handle_tool_use(&id, &name, input, snapshot, peers, &mut output)
                            .await;
                        results.push(result);
                    }
                    // The model never sends these; ignore if it does.
                    ContentPart::ToolResult { .. } => {}
                }
            }

            if results.is_empty() {
                break;
            }
            conversation.push(Turn::user_parts(results));

            if budget_exhausted {
                tracing::warn!(
                    max_tool_calls = self.settings.max_tool_calls,
                    "orchestrator: tool call budget exhausted"
                );
                output.push(format!(
                    "[Maximum tool call limit ({}) reached]",
                    self.settings.max_tool_calls
                ));
                break;
            }

            response = self.call_model(&conversation, &tools).await?;
        }

        tracing::info!(
            tool_calls,
            budget_exhausted,
            turns = conversation.len(),
            "orchestrator: run finished"
        );

        Ok(RunOutcome {
            reply: output.join("\n"),
            conversation,
            tool_calls,
            budget_exhausted,
        })
    }

    fn with_hint(&self, utterance: &str) -> String {
        if self.settings.response_hint.is_empty() {
            utterance.to_string()
        } else {
            format!("{utterance}\n\n{}", self.settings.response_hint)
        }
    }

    async fn call_model(
        &self,
        conversation: &Conversation,
        tools: &[ToolSpec],
    ) -> Result<ModelResponse, AgentError> {
        tokio::time::timeout(
            self.settings.model_timeout,
            self.model.complete(conversation.turns(), tools),
        )
        .await
        .map_err(|_| AgentError::ModelTimeout {
            timeout_secs: self.settings.model_timeout.as_secs(),
        })?
        .map_err(AgentError::from)
    }

    /// Dispatch one tool-use part, record any note in `output`, and build
    /// the tool result for the model.
    async fn handle_tool_use(
        &self,
        id: &str,
        name: &str,
        input: serde_json::Value,
        snapshot: &DirectorySnapshot,
        peers: &dyn PeerLookup,
        output: &mut Vec<String>,
    ) -> ContentPart {
        match self.dispatch(name, input, snapshot, peers).await {
            Dispatch::Missing => {
                output.push(format!("[No MCP server provides tool {name}]"));
                ContentPart::tool_result(id, format!("No MCP server provides tool {name}"), true)
            }
            Dispatch::Failed(detail) => {
                output.push(format!("[Error calling tool {name}: {detail}]"));
                ContentPart::tool_result(id, format!("Error calling tool {name}: {detail}"), true)
            }
            Dispatch::Done(result) => {
                let text = result.text();
                if url_pattern().is_match(&text) {
                    output.push(format!("Tool result: {text}"));
                }
                let payload = serde_json::to_string(&result.content)
                    .unwrap_or_else(|_| text.clone());
                ContentPart::tool_result(id, truncate_tool_result(&payload, name), result.is_error)
            }
        }
    }

    async fn dispatch(
        &self,
        name: &str,
        input: serde_json::Value,
        snapshot: &DirectorySnapshot,
        peers: &dyn PeerLookup,
    ) -> Dispatch {
        let Some(connection_id) = snapshot.lookup(name) else {
            tracing::warn!(tool = %name, "orchestrator: no connection provides tool");
            return Dispatch::Missing;
        };
        let Some(peer) = peers.peer(connection_id) else {
            tracing::warn!(tool = %name, connection = %connection_id, "orchestrator: owning connection is gone");
            return Dispatch::Missing;
        };

        tracing::info!(tool = %name, connection = %connection_id, "orchestrator: dispatching tool call");
        match tokio::time::timeout(self.settings.tool_timeout, peer.call_tool(name, input)).await {
            Ok(Ok(result)) => Dispatch::Done(result),
            Ok(Err(e)) => {
                tracing::warn!(tool = %name, connection = %connection_id, error = %e, "orchestrator: tool call failed");
                Dispatch::Failed(e.to_string())
            }
            Err(_) => {
                let detail = format!(
                    "timed out after {}ms",
                    self.settings.tool_timeout.as_millis()
                );
                tracing::warn!(tool = %name, connection = %connection_id, "orchestrator: tool call {detail}");
                Dispatch::Failed(detail)
            }
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// The directory catalog in the model's tool format.
pub fn tool_specs(snapshot: &DirectorySnapshot) -> Vec<ToolSpec> {
    snapshot
        .tools()
        .iter()
        .map(|entry| ToolSpec {
            name: entry.definition.name.clone(),
            description: entry.definition.description.clone(),
            input_schema: entry.definition.input_schema.to_json_schema(),
        })
        .collect()
}

/// Truncate a tool result if it exceeds `MAX_TOOL_RESULT_CHARS`.
///
/// Keeps the beginning of the result and appends a truncation notice.
fn truncate_tool_result(result: &str, tool_name: &str) -> String {
    if result.len() <= MAX_TOOL_RESULT_CHARS {
        return result.to_string();
    }

    let truncated = crate::truncate_utf8(result, MAX_TOOL_RESULT_CHARS);
    tracing::warn!(
        tool = %tool_name,
        original_len = result.len(),
        truncated_to = truncated.len(),
        "tool result truncated"
    );
    format!(
        "{truncated}\n\n[... truncated: showing first {} of {} chars]",
        truncated.len(),
        result.len()
    )
}

// ─── Tests ──────────────────────────────────────────────────────────────────
