//! Connection registry: owns every named peer connection.
//!
//! Provides:
//! - `connect` / `disconnect` driving the lifecycle state machine
//! - Liveness monitoring (periodic `ping`) and process-exit detection
//! - Read-only views (`get`, `list`) and the connected peer set for routing
//!
//! Background tasks hold only a `Weak` reference to the registry. Probe
//! failures and unexpected exits funnel into one removal routine keyed by
//! `(id, generation)`, so a late signal from an old connection can never
//! remove a newer one registered under the same id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::client::{McpClient, McpPeer, DEFAULT_REQUEST_TIMEOUT_MS};
use super::errors::McpError;
use super::lifecycle::{self, ConnectionState};
use super::process::{ProcessHandle, ProcessSupervisor};
use super::types::{ServerConfig, ServerInfo};

// ─── Settings ────────────────────────────────────────────────────────────────

/// Shortest probe period the monitor will run at.
const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(10);

/// Timeouts and intervals governing every connection in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    /// Bound on spawn + `initialize` + `notifications/initialized`.
    pub handshake_timeout: Duration,
    /// Time between liveness probes.
    pub probe_interval: Duration,
    /// Bound on a single liveness probe.
    pub probe_timeout: Duration,
    /// Bound on `tools/list` and `tools/call` requests.
    pub request_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

// ─── Views ───────────────────────────────────────────────────────────────────

/// Read-only snapshot of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: String,
    pub state: ConnectionState,
    /// Registry-assigned generation; later connections have larger values.
    pub generation: u64,
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub pid: Option<u32>,
}

/// Resolves a connection id to the peer that serves it.
pub trait PeerLookup: Send + Sync {
    fn peer(&self, id: &str) -> Option<Arc<dyn McpPeer>>;
}

impl PeerLookup for HashMap<String, Arc<dyn McpPeer>> {
    fn peer(&self, id: &str) -> Option<Arc<dyn McpPeer>> {
        self.get(id).cloned()
    }
}

// ─── Internal State ──────────────────────────────────────────────────────────

struct Entry {
    generation: u64,
    state: ConnectionState,
    server_info: Option<ServerInfo>,
    pid: Option<u32>,
    live: Option<LiveConnection>,
}

impl Entry {
    fn info(&self, id: &str) -> ConnectionInfo {
        let server = self.server_info.as_ref();
        ConnectionInfo {
            id: id.to_string(),
            state: self.state,
            generation: self.generation,
            server_name: server.and_then(|s| s.name.clone()),
            server_version: server.and_then(|s| s.version.clone()),
            pid: self.pid,
        }
    }
}

struct LiveConnection {
    client: Arc<McpClient>,
    process: ProcessHandle,
    monitor: Option<JoinHandle<()>>,
    exit_watch: Option<JoinHandle<()>>,
}

impl LiveConnection {
    fn stop_monitoring(&mut self) {
        if let Some(task) = self.monitor.take() {
            task.abort();
        }
        if let Some(task) = self.exit_watch.take() {
            task.abort();
        }
    }
}

struct RegistryInner {
    connections: Mutex<HashMap<String, Entry>>,
    supervisor: ProcessSupervisor,
    settings: RegistrySettings,
    next_generation: AtomicU64,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop a connection that failed on its own (probe failure or exit).
    ///
    /// Only removes the entry if it is still the same generation and still
    /// `Connected`; a disconnect in progress owns its own teardown.
    fn drop_failed(&self, id: &str, generation: u64, reason: &str) {
        let removed = {
            let mut conns = self.lock();
            match conns.get(id) {
                Some(entry)
                    if entry.generation == generation
                        && entry.state == ConnectionState::Connected =>
                {
                    conns.remove(id)
                }
                _ => None,
            }
        };

        let Some(mut entry) = removed else { return };
        tracing::warn!(connection = id, generation, reason, "connection lost, removed");
        if let Some(mut live) = entry.live.take() {
            live.stop_monitoring();
            self.supervisor.cleanup(Some(&live.process));
        }
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        let conns = self
            .connections
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for entry in conns.values_mut() {
            if let Some(live) = entry.live.as_mut() {
                live.stop_monitoring();
            }
        }
    }
}

// ─── ConnectionRegistry ──────────────────────────────────────────────────────

/// Named MCP connections with lifecycle supervision. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(RegistrySettings::default())
    }
}

impl ConnectionRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self::with_supervisor(settings, ProcessSupervisor::new())
    }

    /// Registry that spawns through an existing supervisor.
    pub fn with_supervisor(settings: RegistrySettings, supervisor: ProcessSupervisor) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: Mutex::new(HashMap::new()),
                supervisor,
                settings,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.inner.supervisor
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Launch `config` as connection `id` and complete the MCP handshake.
    ///
    /// Fails with `DuplicateId` if `id` is already registered (in any state).
    /// On `ConnectFailed` the process has already been killed and reaped and
    /// the id is free again.
    pub async fn connect(&self, id: &str, config: &ServerConfig) -> Result<(), McpError> {
        let generation = {
            let mut conns = self.inner.lock();
            if conns.contains_key(id) {
                return Err(McpError::DuplicateId { id: id.to_string() });
            }
            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            conns.insert(
                id.to_string(),
                Entry {
                    generation,
                    state: ConnectionState::Connecting,
                    server_info: None,
                    pid: None,
                    live: None,
                },
            );
            generation
        };

        tracing::info!(
            connection = id,
            generation,
            command = %config.command,
            args = ?config.args,
            "connecting"
        );

        let settings = self.inner.settings;
        let established = match lifecycle::establish(
            &self.inner.supervisor,
            id,
            config,
            settings.handshake_timeout,
            settings.request_timeout,
        )
        .await
        {
            Ok(established) => established,
            Err(e) => {
                let mut conns = self.inner.lock();
                if conns.get(id).is_some_and(|entry| entry.generation == generation) {
                    conns.remove(id);
                }
                drop(conns);
                tracing::warn!(connection = id, error = %e, "connect failed");
                return Err(e);
            }
        };

        let installed = {
            let mut conns = self.inner.lock();
            match conns.get_mut(id) {
                Some(entry)
                    if entry.generation == generation
                        && entry.state == ConnectionState::Connecting =>
                {
                    let weak = Arc::downgrade(&self.inner);
                    let monitor = tokio::spawn(monitor_liveness(
                        weak.clone(),
                        id.to_string(),
                        generation,
                        established.client.clone(),
                        settings.probe_interval,
                        settings.probe_timeout,
                    ));
                    let exit_watch = tokio::spawn(watch_exit(
                        weak,
                        id.to_string(),
                        generation,
                        established.process.clone(),
                    ));

                    entry.state = ConnectionState::Connected;
                    entry.server_info = established.init.server_info.clone();
                    entry.pid = established.process.pid();
                    entry.live = Some(LiveConnection {
                        client: Arc::clone(&established.client),
                        process: established.process.clone(),
                        monitor: Some(monitor),
                        exit_watch: Some(exit_watch),
                    });
                    true
                }
                _ => false,
            }
        };

        if installed {
            return Ok(());
        }

        // Disconnected while the handshake was in flight.
        self.inner
            .supervisor
            .terminate(Some(&established.process))
            .await;
        Err(McpError::ConnectFailed {
            id: id.to_string(),
            reason: "disconnected during handshake".into(),
        })
    }

    /// Gracefully tear down connection `id`. No-op if unknown or already
    /// disconnecting.
    pub async fn disconnect(&self, id: &str) {
        let (generation, live) = {
            let mut conns = self.inner.lock();
            let Some(entry) = conns.get_mut(id) else {
                tracing::debug!(connection = id, "disconnect: unknown connection");
                return;
            };
            match entry.state {
                ConnectionState::Disconnecting => return,
                ConnectionState::Connecting => {
                    // The pending connect sees its entry gone and tears down.
                    conns.remove(id);
                    tracing::info!(connection = id, "cancelled pending connection");
                    return;
                }
                ConnectionState::Connected => {}
            }
            entry.state = ConnectionState::Disconnecting;
            let mut live = entry.live.take();
            if let Some(live) = live.as_mut() {
                live.stop_monitoring();
            }
            (entry.generation, live)
        };

        if let Some(live) = &live {
            self.inner.supervisor.terminate(Some(&live.process)).await;
        }

        let mut conns = self.inner.lock();
        if conns.get(id).is_some_and(|entry| entry.generation == generation) {
            conns.remove(id);
        }
        tracing::info!(connection = id, generation, "disconnected");
    }

    /// Disconnect every registered connection concurrently.
    pub async fn disconnect_all(&self) {
        let ids = self.list();
        futures::future::join_all(ids.iter().map(|id| self.disconnect(id))).await;
    }

    /// Disconnect everything, then make sure no supervised process survives.
    pub async fn shutdown(&self) {
        self.disconnect_all().await;
        self.inner.supervisor.shutdown_all().await;
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<ConnectionInfo> {
        self.inner.lock().get(id).map(|entry| entry.info(id))
    }

    /// Registered connection ids, in no particular order.
    pub fn list(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Connected peers in generation order.
    pub fn peers(&self) -> Vec<(String, Arc<dyn McpPeer>)> {
        let conns = self.inner.lock();
        let mut connected: Vec<(u64, String, Arc<dyn McpPeer>)> = conns
            .iter()
            .filter(|(_, entry)| entry.state == ConnectionState::Connected)
            .filter_map(|(id, entry)| {
                let live = entry.live.as_ref()?;
                let peer: Arc<dyn McpPeer> = live.client.clone();
                Some((entry.generation, id.clone(), peer))
            })
            .collect();
        drop(conns);

        connected.sort_by_key(|(generation, _, _)| *generation);
        connected
            .into_iter()
            .map(|(_, id, peer)| (id, peer))
            .collect()
    }
}

impl PeerLookup for ConnectionRegistry {
    fn peer(&self, id: &str) -> Option<Arc<dyn McpPeer>> {
        let conns = self.inner.lock();
        let entry = conns.get(id)?;
        if entry.state != ConnectionState::Connected {
            return None;
        }
        let live = entry.live.as_ref()?;
        let peer: Arc<dyn McpPeer> = live.client.clone();
        Some(peer)
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

async fn monitor_liveness(
    registry: Weak<RegistryInner>,
    id: String,
    generation: u64,
    peer: Arc<dyn McpPeer>,
    interval: Duration,
    probe_timeout: Duration,
) {
    // `interval_at` panics on a zero period.
    let interval = interval.max(MIN_PROBE_INTERVAL);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let failure = match tokio::time::timeout(probe_timeout, peer.ping()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("no reply within {}ms", probe_timeout.as_millis())),
        };
        let Some(inner) = registry.upgrade() else { return };
        match failure {
            None => tracing::trace!(connection = %id, "liveness probe ok"),
            Some(reason) => {
                inner.drop_failed(&id, generation, &format!("liveness probe failed: {reason}"));
                return;
            }
        }
    }
}

async fn watch_exit(
    registry: Weak<RegistryInner>,
    id: String,
    generation: u64,
    process: ProcessHandle,
) {
    process.wait_exit().await;
    if let Some(inner) = registry.upgrade() {
        inner.drop_failed(&id, generation, "server process exited");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
