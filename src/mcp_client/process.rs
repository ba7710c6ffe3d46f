//! Child process supervision.
//!
//! Spawns MCP server processes, keeps the set of live ones, and owns every
//! signal sent to them. Each child is moved into a watcher task that reaps it,
//! applies termination requests, and drops it from the live set as soon as it
//! exits, whether it was asked to or not.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};

use super::errors::McpError;
use super::types::ServerConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long `terminate` waits after SIGTERM before force-killing.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Lines of stderr kept per process for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

// ─── Handles ─────────────────────────────────────────────────────────────────

/// Supervisor-assigned process identity (stable even after the OS pid is reused).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(u64);

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

/// Shared handle to a supervised process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: ProcessId,
    name: String,
    pid: Option<u32>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    exited: watch::Receiver<bool>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl ProcessHandle {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// OS process id, if the platform reported one at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process has been reaped.
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Resolve once the process is gone.
    pub async fn wait_exit(&self) {
        let mut exited = self.exited.clone();
        // Err only if the watcher vanished without reporting, which means the
        // child was dropped (and killed) with it.
        let _ = exited.wait_for(|gone| *gone).await;
    }

    /// The last few lines the process wrote to stderr.
    pub fn stderr_tail(&self) -> String {
        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// A freshly spawned process with its stdio pipes.
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

// ─── ProcessSupervisor ───────────────────────────────────────────────────────

type LiveSet = Arc<Mutex<HashMap<ProcessId, ProcessHandle>>>;

/// Spawns, tracks, and terminates child processes. Cheap to clone.
#[derive(Clone)]
pub struct ProcessSupervisor {
    live: LiveSet,
    next_id: Arc<AtomicU64>,
    grace_period: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::with_grace_period(DEFAULT_GRACE_PERIOD)
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            live: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            grace_period,
        }
    }

    /// Spawn a process for `config` and start supervising it.
    ///
    /// stdin/stdout are piped for the caller; stderr is drained into the log.
    pub fn spawn(&self, name: &str, config: &ServerConfig) -> Result<SpawnedProcess, McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.envs(&config.env);
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{}: {e}", config.command),
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            return Err(McpError::SpawnFailed {
                name: name.to_string(),
                reason: "failed to capture stdio".into(),
            });
        };

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(
                name.to_string(),
                stderr,
                Arc::clone(&stderr_tail),
            ));
        }

        let id = ProcessId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(false);

        let handle = ProcessHandle {
            id,
            name: name.to_string(),
            pid: child.id(),
            signal_tx,
            exited: exit_rx,
            stderr_tail,
        };

        self.lock_live().insert(id, handle.clone());
        tracing::debug!(
            server = name,
            pid = ?handle.pid,
            command = %config.command,
            "spawned server process"
        );

        tokio::spawn(watch_process(
            child,
            handle.name.clone(),
            id,
            signal_rx,
            exit_tx,
            Arc::clone(&self.live),
        ));

        Ok(SpawnedProcess {
            handle,
            stdin,
            stdout,
        })
    }

    /// Ask the process to exit, force-kill it after the grace period, and
    /// return once it is gone. No-op for `None` or an already exited process.
    pub async fn terminate(&self, handle: Option<&ProcessHandle>) {
        let Some(handle) = handle else { return };
        if handle.has_exited() {
            return;
        }

        let _ = handle.signal_tx.send(Signal::Terminate);
        if tokio::time::timeout(self.grace_period, handle.wait_exit())
            .await
            .is_err()
        {
            tracing::warn!(
                server = %handle.name,
                grace_ms = self.grace_period.as_millis() as u64,
                "process ignored SIGTERM, killing"
            );
            let _ = handle.signal_tx.send(Signal::Kill);
            handle.wait_exit().await;
        }
    }

    /// Force-kill the process if it is still alive. Does not wait.
    pub fn cleanup(&self, handle: Option<&ProcessHandle>) {
        if let Some(handle) = handle {
            if !handle.has_exited() {
                let _ = handle.signal_tx.send(Signal::Kill);
            }
        }
    }

    /// Terminate every live process concurrently.
    pub async fn shutdown_all(&self) {
        let handles: Vec<ProcessHandle> = self.lock_live().values().cloned().collect();
        if handles.is_empty() {
            return;
        }
        tracing::info!(count = handles.len(), "terminating all server processes");
        futures::future::join_all(handles.iter().map(|h| self.terminate(Some(h)))).await;
    }

    /// Number of processes that have not exited yet.
    pub fn live_count(&self) -> usize {
        self.lock_live().len()
    }

    pub fn is_live(&self, handle: &ProcessHandle) -> bool {
        self.lock_live().contains_key(&handle.id)
    }

    fn lock_live(&self) -> MutexGuard<'_, HashMap<ProcessId, ProcessHandle>> {
        self.live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ─── Watcher ─────────────────────────────────────────────────────────────────

async fn watch_process(
    mut child: Child,
    name: String,
    id: ProcessId,
    mut signal_rx: mpsc::UnboundedReceiver<Signal>,
    exit_tx: watch::Sender<bool>,
    live: LiveSet,
) {
    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => tracing::debug!(server = %name, %status, "server process exited"),
                    Err(e) => tracing::warn!(server = %name, error = %e, "failed to reap server process"),
                }
                break;
            }
            signal = signal_rx.recv() => match signal {
                Some(Signal::Terminate) => send_terminate(&mut child),
                Some(Signal::Kill) => {
                    let _ = child.start_kill();
                }
                None => {
                    let _ = child.wait().await;
                    break;
                }
            },
        }
    }

    live.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(&id);
    exit_tx.send_replace(true);
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

async fn drain_stderr(name: String, stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %name, stderr = %line, "server stderr");
        let mut tail = tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ServerConfig {
        ServerConfig::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_spawn_registers_and_terminate_removes() {
        let supervisor = ProcessSupervisor::new();
        let spawned = supervisor.spawn("sleeper", &sh("sleep 30")).unwrap();
        assert_eq!(supervisor.live_count(), 1);
        assert!(supervisor.is_live(&spawned.handle));

        supervisor.terminate(Some(&spawned.handle)).await;
        assert!(spawned.handle.has_exited());
        assert_eq!(supervisor.live_count(), 0);
    }

    #[tokio::test]
    async fn test_self_exit_leaves_live_set() {
        let supervisor = ProcessSupervisor::new();
        let spawned = supervisor.spawn("quick", &sh("exit 0")).unwrap();
        spawned.handle.wait_exit().await;
        assert_eq!(supervisor.live_count(), 0);
    }

    #[tokio::test]
    async fn test_terminate_kills_after_grace_period() {
        let supervisor = ProcessSupervisor::with_grace_period(Duration::from_millis(200));
        let spawned = supervisor
            .spawn("stubborn", &sh("trap '' TERM; while true; do sleep 1; done"))
            .unwrap();
        // Let the shell install its trap before signalling.
        tokio::time::sleep(Duration::from_millis(100)).await;

        supervisor.terminate(Some(&spawned.handle)).await;
        assert!(spawned.handle.has_exited());
        assert_eq!(supervisor.live_count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_force_kills() {
        let supervisor = ProcessSupervisor::new();
        let spawned = supervisor.spawn("sleeper", &sh("sleep 30")).unwrap();
        supervisor.cleanup(Some(&spawned.handle));
        tokio::time::timeout(Duration::from_secs(5), spawned.handle.wait_exit())
            .await
            .expect("process should die after cleanup");
        assert_eq!(supervisor.live_count(), 0);
    }

    #[tokio::test]
    async fn test_terminate_none_is_noop() {
        let supervisor = ProcessSupervisor::new();
        supervisor.terminate(None).await;
        supervisor.cleanup(None);
        assert_eq!(supervisor.live_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let supervisor = ProcessSupervisor::new();
        let a = supervisor.spawn("a", &sh("sleep 30")).unwrap();
        let b = supervisor.spawn("b", &sh("sleep 30")).unwrap();
        assert_eq!(supervisor.live_count(), 2);

        supervisor.shutdown_all().await;
        assert!(a.handle.has_exited());
        assert!(b.handle.has_exited());
        assert_eq!(supervisor.live_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let supervisor = ProcessSupervisor::new();
        let result = supervisor.spawn("ghost", &ServerConfig::new("/nonexistent/mcp-server", vec![]));
        assert!(matches!(result, Err(McpError::SpawnFailed { .. })));
        assert_eq!(supervisor.live_count(), 0);
    }

    #[tokio::test]
    async fn test_stderr_tail_captured() {
        let supervisor = ProcessSupervisor::new();
        let spawned = supervisor
            .spawn("noisy", &sh("echo boom >&2; exit 3"))
            .unwrap();
        spawned.handle.wait_exit().await;
        // The drain task may finish slightly after the reaper.
        for _ in 0..50 {
            if !spawned.handle.stderr_tail().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(spawned.handle.stderr_tail(), "boom");
    }
}
