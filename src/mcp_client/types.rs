//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types and MCP protocol structures.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// MCP protocol revision sent in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (a request without an id).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

fn default_jsonrpc() -> String {
    "2.0".to_string()
}

impl JsonRpcResponse {
    /// Successful response to a peer-initiated request.
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Error response to a peer-initiated request.
    pub fn failure(id: u64, code: i32, message: &str) -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: Some(id),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ─── Launch Configuration ───────────────────────────────────────────────────

/// How to launch one peer: executable, arguments, env overrides, working dir.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Layered on top of the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

impl ServerConfig {
    /// Launch spec from a command and its arguments, with no env overrides.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            cwd: None,
        }
    }
}

/// Top-level MCP servers file (`{"mcpServers": {...}}`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersConfig {
    #[serde(default, rename = "mcpServers", alias = "servers")]
    pub servers: HashMap<String, ServerConfig>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: serde_json::Value,
    pub client_info: ClientInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({
                "prompts": {},
                "resources": {},
                "tools": {},
            }),
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// Identifies this client in the handshake.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Validated capability record for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: InputSchema,
}

/// Object-typed parameter schema: named parameters plus the required subset.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl InputSchema {
    /// Render as a JSON Schema object (`{"type": "object", ...}`).
    pub fn to_json_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": self.properties,
            "required": self.required,
        })
    }
}

/// Result of a `tools/call` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Text items joined by blank lines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|item| match item {
                ContentItem::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Content item in a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: serde_json::Value,
    },
    /// Item kinds this client does not interpret.
    #[serde(other)]
    Other,
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        // params should be omitted when None
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_notification_has_no_id() {
        let note = JsonRpcNotification::new("notifications/initialized", None);
        let json = serde_json::to_string(&note).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn test_json_rpc_error_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.id, Some(2));
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_initialize_params_shape() {
        let params = serde_json::to_value(InitializeParams::default()).unwrap();
        assert_eq!(params["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(params["clientInfo"]["name"], "mcp-relay");
        assert!(params["capabilities"]["tools"].is_object());
    }

    #[test]
    fn test_servers_file_parses_mcp_servers_key() {
        let json = r#"{
            "mcpServers": {
                "weather": {
                    "command": "node",
                    "args": ["build/index.js"],
                    "env": {"API_KEY": "k"},
                    "cwd": "/srv/weather"
                },
                "bare": {"command": "uvx"}
            }
        }"#;
        let config: McpServersConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.servers.len(), 2);
        let weather = &config.servers["weather"];
        assert_eq!(weather.args, vec!["build/index.js"]);
        assert_eq!(weather.env["API_KEY"], "k");
        assert_eq!(weather.cwd.as_deref(), Some("/srv/weather"));
        assert!(config.servers["bare"].args.is_empty());
    }

    #[test]
    fn test_call_tool_result_text_skips_non_text() {
        let json = r#"{
            "content": [
                {"type": "text", "text": "first"},
                {"type": "image", "data": "AAAA", "mimeType": "image/png"},
                {"type": "audio", "data": "AAAA"},
                {"type": "text", "text": "second"}
            ]
        }"#;
        let result: CallToolResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.content.len(), 4);
        assert_eq!(result.content[2], ContentItem::Other);
        assert_eq!(result.text(), "first\n\nsecond");
        assert!(!result.is_error);
    }

    #[test]
    fn test_input_schema_to_json_schema() {
        let mut properties = serde_json::Map::new();
        properties.insert("city".into(), serde_json::json!({"type": "string"}));
        let schema = InputSchema {
            properties,
            required: vec!["city".into()],
        };
        let json = schema.to_json_schema();
        assert_eq!(json["type"], "object");
        assert_eq!(json["required"][0], "city");
    }
}
