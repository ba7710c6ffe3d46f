//! MCP protocol client for a single peer.
//!
//! Wraps a [`StdioTransport`] with the four MCP methods this crate speaks:
//! `initialize`, `ping`, `tools/list`, and `tools/call`. The [`McpPeer`] trait
//! is the seam the tool directory and orchestrator dispatch through.

use std::time::Duration;

use async_trait::async_trait;

use super::errors::McpError;
use super::transport::StdioTransport;
use super::types::{CallToolResult, InitializeParams, InitializeResult};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for a single request (ms).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Upper bound on `tools/list` pages followed for one listing.
const MAX_LIST_PAGES: usize = 64;

// ─── McpPeer ─────────────────────────────────────────────────────────────────

/// Operations the rest of the crate needs from a connected peer.
#[async_trait]
pub trait McpPeer: Send + Sync {
    /// Raw tool descriptors as the peer reported them, unvalidated.
    async fn list_tools(&self) -> Result<Vec<serde_json::Value>, McpError>;

    /// Invoke a tool by name with JSON arguments.
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError>;

    async fn ping(&self) -> Result<(), McpError>;
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Protocol client bound to one transport.
pub struct McpClient {
    server_name: String,
    transport: StdioTransport,
    request_timeout: Duration,
}

impl McpClient {
    pub fn new(server_name: &str, transport: StdioTransport) -> Self {
        Self {
            server_name: server_name.to_string(),
            transport,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }

    /// Set the per-request timeout used by `tools/list`, `tools/call` and `ping`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Run the MCP handshake: `initialize`, then `notifications/initialized`.
    pub async fn initialize(&self, timeout: Duration) -> Result<InitializeResult, McpError> {
        let params = serde_json::to_value(InitializeParams::default()).map_err(|e| {
            McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to serialize initialize params: {e}"),
            }
        })?;

        let result = self
            .transport
            .request("initialize", Some(params), timeout)
            .await?;

        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::InvalidResponse {
                server: self.server_name.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        self.transport
            .notify("notifications/initialized", None)
            .await?;

        tracing::debug!(
            server = %self.server_name,
            protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
            "handshake complete"
        );
        Ok(init)
    }

}

#[async_trait]
impl McpPeer for McpClient {
    async fn list_tools(&self) -> Result<Vec<serde_json::Value>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let result = self
                .transport
                .request("tools/list", params, self.request_timeout)
                .await?;

            let page = result
                .get("tools")
                .and_then(|t| t.as_array())
                .ok_or_else(|| McpError::InvalidResponse {
                    server: self.server_name.clone(),
                    reason: "tools/list result has no 'tools' array".into(),
                })?;
            tools.extend(page.iter().cloned());

            cursor = result
                .get("nextCursor")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            if cursor.is_none() {
                return Ok(tools);
            }
        }

        tracing::warn!(
            server = %self.server_name,
            pages = MAX_LIST_PAGES,
            "tools/list pagination did not terminate, using tools seen so far"
        );
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });

        let result = self
            .transport
            .request("tools/call", Some(params), self.request_timeout)
            .await?;

        serde_json::from_value(result).map_err(|e| McpError::InvalidResponse {
            server: self.server_name.clone(),
            reason: format!("malformed tools/call result: {e}"),
        })
    }

    async fn ping(&self) -> Result<(), McpError> {
        self.transport
            .request("ping", None, self.request_timeout)
            .await?;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
