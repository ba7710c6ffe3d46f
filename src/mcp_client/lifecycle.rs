//! Connection lifecycle: states and the bring-up sequence.
//!
//! Bringing a peer up means spawning its process, wiring a transport to the
//! child's stdio, and completing the MCP handshake within a deadline. Any
//! failure along the way kills the process and waits for it to be reaped
//! before the error is returned, so a failed connect never leaves a child
//! behind.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::client::McpClient;
use super::errors::McpError;
use super::process::{ProcessHandle, ProcessSupervisor};
use super::transport::StdioTransport;
use super::types::{InitializeResult, ServerConfig};

/// Stderr included in a failure reason is cut to this many bytes.
const MAX_STDERR_IN_ERROR: usize = 2000;

// ─── ConnectionState ─────────────────────────────────────────────────────────

/// Where a connection is in its life.
///
/// `Connecting → Connected → Disconnecting → (removed)`. A failed handshake
/// goes straight from `Connecting` to removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

// ─── Bring-up ────────────────────────────────────────────────────────────────

/// A peer that finished its handshake.
pub struct Established {
    pub client: Arc<McpClient>,
    pub process: ProcessHandle,
    pub init: InitializeResult,
}

/// Spawn `config` under `supervisor` and complete the MCP handshake.
///
/// Every failure is reported as `ConnectFailed` for `id`.
pub async fn establish(
    supervisor: &ProcessSupervisor,
    id: &str,
    config: &ServerConfig,
    handshake_timeout: Duration,
    request_timeout: Duration,
) -> Result<Established, McpError> {
    let spawned = supervisor
        .spawn(id, config)
        .map_err(|e| McpError::ConnectFailed {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
    let process = spawned.handle;

    let transport = StdioTransport::new(id, spawned.stdin, spawned.stdout);
    let client = McpClient::new(id, transport).with_request_timeout(request_timeout);

    let outcome = tokio::time::timeout(handshake_timeout, client.initialize(handshake_timeout)).await;
    let reason = match outcome {
        Ok(Ok(init)) => {
            tracing::info!(
                connection = id,
                pid = ?process.pid(),
                server = init.server_info.as_ref().and_then(|s| s.name.as_deref()).unwrap_or("unknown"),
                "connection established"
            );
            return Ok(Established {
                client: Arc::new(client),
                process,
                init,
            });
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!(
            "handshake timed out after {}ms",
            handshake_timeout.as_millis()
        ),
    };

    supervisor.cleanup(Some(&process));
    process.wait_exit().await;

    let stderr = process.stderr_tail();
    if !stderr.is_empty() {
        tracing::warn!(connection = id, stderr = %stderr, "server stderr captured on failure");
    }

    Err(McpError::ConnectFailed {
        id: id.to_string(),
        reason: format!("{reason}{}", format_stderr_suffix(&stderr)),
    })
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        return String::new();
    }
    if stderr.len() > MAX_STDERR_IN_ERROR {
        let cut = crate::truncate_utf8(stderr, MAX_STDERR_IN_ERROR);
        format!(" | stderr: {cut}...(truncated)")
    } else {
        format!(" | stderr: {stderr}")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
