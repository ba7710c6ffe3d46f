//! Shared types for the inference client.
//!
//! These mirror the Anthropic Messages API content model: a conversation is a
//! list of turns, and each turn is either plain text or a list of typed parts
//! (text, tool-use requests, tool results). The same types are used for
//! request building, response parsing, and the stored conversation.

use serde::{Deserialize, Serialize};

// ─── Conversation ────────────────────────────────────────────────────────────

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: TurnContent,
}

impl Turn {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: TurnContent::Parts(parts),
        }
    }

    pub fn assistant_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::Assistant,
            content: TurnContent::Parts(parts),
        }
    }

    /// Parts of this turn, treating plain text as a single text part.
    pub fn parts(&self) -> Vec<ContentPart> {
        match &self.content {
            TurnContent::Text(text) => vec![ContentPart::Text { text: text.clone() }],
            TurnContent::Parts(parts) => parts.clone(),
        }
    }
}

/// Turn content: a bare string or a list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A typed content part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    /// The model asks for a tool to be run.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Our answer to a `ToolUse` with the same id.
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "is_false")]
        is_error: bool,
    },
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ContentPart {
    pub fn tool_result(tool_use_id: &str, content: impl Into<String>, is_error: bool) -> Self {
        ContentPart::ToolResult {
            tool_use_id: tool_use_id.to_string(),
            content: content.into(),
            is_error,
        }
    }
}

// ─── Request Types ───────────────────────────────────────────────────────────

/// Tool definition sent in the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema object for the tool's arguments.
    pub input_schema: serde_json::Value,
}

/// Request body for `POST /v1/messages`.
#[derive(Debug, Clone, Serialize)]
pub struct MessagesRequest<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<&'a str>,
    pub messages: &'a [Turn],
    #[serde(skip_serializing_if = "no_tools")]
    pub tools: &'a [ToolSpec],
}

fn no_tools(tools: &&[ToolSpec]) -> bool {
    tools.is_empty()
}

// ─── Response Types ──────────────────────────────────────────────────────────

/// A completed model response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    /// Content parts in the order the model produced them.
    pub parts: Vec<ContentPart>,
    /// Why the model stopped: `"end_turn"`, `"tool_use"`, `"max_tokens"`, ...
    pub stop_reason: Option<String>,
}

impl ModelResponse {
    /// Response made of one text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![ContentPart::Text { text: text.into() }],
            stop_reason: Some("end_turn".into()),
        }
    }
}

/// Raw response body from `POST /v1/messages`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub content: Vec<ResponseBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// One content block in a raw response.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    /// Block kinds that are not fed back into the conversation.
    #[serde(other)]
    Other,
}

/// Token accounting reported by the API.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

impl From<MessagesResponse> for ModelResponse {
    fn from(raw: MessagesResponse) -> Self {
        let parts = raw
            .content
            .into_iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(ContentPart::Text { text }),
                ResponseBlock::ToolUse { id, name, input } => {
                    Some(ContentPart::ToolUse { id, name, input })
                }
                ResponseBlock::Other => None,
            })
            .collect();
        Self {
            parts,
            stop_reason: raw.stop_reason,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
