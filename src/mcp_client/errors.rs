//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// `connect` was called with an id that is already registered.
    #[error("connection '{id}' already exists")]
    DuplicateId { id: String },

    /// The peer could not be brought up (spawn, handshake failure or timeout).
    ///
    /// The partially created connection has already been torn down when this
    /// is returned.
    #[error("failed to connect '{id}': {reason}")]
    ConnectFailed { id: String, reason: String },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// JSON-RPC communication error (malformed message, I/O error, closed pipe).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request did not get a response in time.
    #[error("'{method}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// A capability listing or tool result did not have the expected shape.
    #[error("invalid response from server '{server}': {reason}")]
    InvalidResponse { server: String, reason: String },
}
