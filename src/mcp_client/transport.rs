//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with MCP server child processes:
//! - Writing JSON-RPC requests to stdin through a single writer task
//! - Reading stdout on a reader task that routes responses by request id
//! - Line-delimited JSON protocol (one JSON object per line)
//!
//! Because responses are matched through a pending table rather than read
//! inline, a liveness probe and a long tool call can be in flight on the
//! same pipe at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{error_codes, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Outgoing line queue depth.
const WRITE_QUEUE_DEPTH: usize = 32;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer_tx: mpsc::Sender<String>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Create a new transport from a child's stdin/stdout (or any byte pipe).
    ///
    /// Must be called from within a Tokio runtime: the reader and writer
    /// tasks are spawned here.
    pub fn new<W, R>(server_name: &str, stdin: W, stdout: R) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (writer_tx, writer_rx) = mpsc::channel::<String>(WRITE_QUEUE_DEPTH);

        let writer_task = tokio::spawn(write_loop(stdin, writer_rx));
        let reader_task = tokio::spawn(read_loop(
            server_name.to_string(),
            stdout,
            Arc::clone(&pending),
            Arc::clone(&closed),
            writer_tx.clone(),
        ));

        Self {
            server_name: server_name.to_string(),
            writer_tx,
            pending,
            closed,
            reader_task,
            writer_task,
        }
    }

    /// Whether the peer's stdout has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send a JSON-RPC request and wait up to `timeout` for the matching
    /// response. Returns the `result` payload.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let mut json = serde_json::to_string(&req).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;
        json.push('\n');

        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);

        // The reader may have drained the table between the check above and
        // the insert; `closed` is set before draining, so re-checking is enough.
        if self.is_closed() {
            self.lock_pending().remove(&id);
            return Err(self.closed_error());
        }

        if self.writer_tx.send(json).await.is_err() {
            self.lock_pending().remove(&id);
            return Err(self.closed_error());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => extract_result(response),
            // Sender dropped: the reader hit EOF and drained the table.
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                self.lock_pending().remove(&id);
                Err(McpError::Timeout {
                    server: self.server_name.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);

        let mut json = serde_json::to_string(&notification).map_err(|e| {
            McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to serialize notification: {e}"),
            }
        })?;
        json.push('\n');

        self.writer_tx
            .send(json)
            .await
            .map_err(|_| self.closed_error())
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: "server stdout closed (process may have exited)".into(),
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

async fn write_loop<W>(mut stdin: W, mut rx: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        if stdin.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
}

async fn read_loop<R>(
    server: String,
    stdout: R,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    writer_tx: mpsc::Sender<String>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "failed to read from server stdout");
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let Ok(message) = serde_json::from_str::<serde_json::Value>(trimmed) else {
            // Not JSON: servers sometimes log to stdout.
            tracing::debug!(server = %server, line = %trimmed, "ignoring non-JSON line");
            continue;
        };

        if let Some(method) = message.get("method").and_then(|m| m.as_str()) {
            handle_peer_message(&server, method, &message, &writer_tx).await;
            continue;
        }

        match serde_json::from_value::<JsonRpcResponse>(message) {
            Ok(resp) => {
                let Some(id) = resp.id else { continue };
                let waiter = pending
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None => tracing::debug!(server = %server, id, "response for unknown request id"),
                }
            }
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "ignoring malformed JSON-RPC message");
            }
        }
    }

    closed.store(true, Ordering::Release);
    // Dropping the senders wakes every waiter with a closed-pipe error.
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clear();
    tracing::debug!(server = %server, "server stdout closed");
}

/// Answer requests and log notifications the server sends to us.
async fn handle_peer_message(
    server: &str,
    method: &str,
    message: &serde_json::Value,
    writer_tx: &mpsc::Sender<String>,
) {
    let Some(id) = message.get("id").cloned() else {
        tracing::debug!(server = %server, method = %method, "server notification");
        return;
    };

    let reply = if method == "ping" {
        serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
    } else {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": error_codes::METHOD_NOT_FOUND,
                "message": format!("method not supported by client: {method}"),
            },
        })
    };

    let mut line = reply.to_string();
    line.push('\n');
    let _ = writer_tx.send(line).await;
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
