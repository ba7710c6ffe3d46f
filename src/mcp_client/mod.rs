//! MCP Client: JSON-RPC over stdio for supervised MCP server connections.
//!
//! This module handles:
//! - Spawning and supervising MCP server child processes
//! - JSON-RPC 2.0 communication over process stdio
//! - Named connections with handshake, liveness probing, and teardown
//! - Tool discovery and routing across all connected servers
//!
//! The orchestrator dispatches model tool calls through the [`ToolDirectory`]
//! and the [`PeerLookup`] implemented by [`ConnectionRegistry`].

pub mod client;
pub mod directory;
pub mod errors;
pub mod lifecycle;
pub mod process;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(all(test, unix))]
pub(crate) mod test_support;

// Re-exports for convenience
pub use client::{McpClient, McpPeer};
pub use directory::{CatalogEntry, DirectorySnapshot, ToolDirectory};
pub use errors::McpError;
pub use lifecycle::ConnectionState;
pub use process::{ProcessHandle, ProcessSupervisor};
pub use registry::{ConnectionInfo, ConnectionRegistry, PeerLookup, RegistrySettings};
pub use types::{CallToolResult, ContentItem, McpServersConfig, ServerConfig, ToolDefinition};
