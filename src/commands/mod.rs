//! Chat-facing command layer.
//!
//! [`Relay`] turns inbound chat messages into replies. Messages starting with
//! `mcp` are management commands (connect, disconnect, list, set-default,
//! reset); everything else is a query for the orchestrator. One reply per
//! message.

pub mod parser;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::agent_core::{AgentError, Conversation, Orchestrator, OrchestratorSettings};
use crate::config::{load_servers_file, ConfigError};
use crate::inference::LanguageModel;
use crate::mcp_client::{
    ConnectionRegistry, McpError, McpServersConfig, RegistrySettings, ServerConfig, ToolDirectory,
};
use crate::TokioMutex;

use parser::{is_command, parse_command_line};

/// Errors from management commands, replied as `Error: <message>`.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no configured server named '{id}'")]
    UnknownServer { id: String },
}

/// Where configured peers come from.
#[derive(Debug, Clone)]
pub enum ServerSource {
    /// Re-read on every use.
    File(PathBuf),
    Fixed(McpServersConfig),
}

impl ServerSource {
    fn load(&self) -> Result<McpServersConfig, ConfigError> {
        match self {
            ServerSource::File(path) => load_servers_file(path),
            ServerSource::Fixed(config) => Ok(config.clone()),
        }
    }
}

/// Registry, directory, orchestrator and conversation behind one chat.
pub struct Relay {
    registry: ConnectionRegistry,
    directory: ToolDirectory,
    orchestrator: Orchestrator,
    servers: ServerSource,
    default_id: Mutex<Option<String>>,
    /// Held for a whole query, so queries run one at a time.
    conversation: TokioMutex<Conversation>,
}

impl Relay {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        orchestrator: OrchestratorSettings,
        connections: RegistrySettings,
        servers: ServerSource,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(connections),
            directory: ToolDirectory::new(),
            orchestrator: Orchestrator::new(model, orchestrator),
            servers,
            default_id: Mutex::new(None),
            conversation: TokioMutex::new(Conversation::new()),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &ToolDirectory {
        &self.directory
    }

    pub fn default_connection(&self) -> Option<String> {
        self.lock_default().clone()
    }

    pub async fn conversation(&self) -> Conversation {
        self.conversation.lock().await.clone()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect every configured server concurrently. Failures are logged.
    ///
    /// The first server (by id) that connects becomes the default if none is
    /// set. Returns how many connected.
    pub async fn start(&self) -> usize {
        let servers = match self.servers.load() {
            Ok(config) => config.servers,
            Err(e) => {
                tracing::error!(error = %e, "failed to load MCP servers");
                return 0;
            }
        };
        if servers.is_empty() {
            tracing::info!("no MCP servers configured");
            return 0;
        }

        let mut entries: Vec<(String, ServerConfig)> = servers.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        tracing::info!(
            servers = ?entries.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            "starting MCP servers"
        );

        let results = futures::future::join_all(entries.iter().map(|(id, config)| async move {
            let result = self.registry.connect(id, config).await;
            (id.as_str(), result)
        }))
        .await;

        let mut connected = 0usize;
        for (id, result) in results {
            match result {
                Ok(()) => {
                    connected += 1;
                    tracing::info!(connection = id, "MCP server started");
                    self.lock_default().get_or_insert_with(|| id.to_string());
                }
                Err(e) => tracing::error!(connection = id, error = %e, "failed to start MCP server"),
            }
        }

        let tools = self.directory.refresh(&self.registry).await;
        tracing::info!(
            connected,
            tools,
            default = ?self.default_connection(),
            "MCP server startup complete"
        );
        connected
    }

    /// Disconnect everything and terminate every peer process.
    pub async fn shutdown(&self) {
        tracing::info!(connections = self.registry.len(), "relay shutting down");
        self.registry.shutdown().await;
        self.directory.refresh_from(Vec::new()).await;
        *self.lock_default() = None;
    }

    // ─── Messages ────────────────────────────────────────────────────────

    /// Reply to one inbound message.
    pub async fn handle_message(&self, message: &str) -> String {
        tracing::info!(len = message.len(), command = is_command(message), "message received");
        if is_command(message) {
            self.handle_command(message).await
        } else {
            self.handle_query(message).await
        }
    }

    async fn handle_command(&self, message: &str) -> String {
        let line = parse_command_line(message);
        let subcommand = line.subcommand();
        let mut args = line.args;

        let result = match subcommand.as_deref() {
            Some("connect") => self.connect(&args).await,
            Some("disconnect") => self.disconnect(&args).await,
            Some("list") => Ok(self.list()),
            Some("set-default") | Some("setdefault") | Some("set") => {
                if args.first().is_some_and(|a| a.eq_ignore_ascii_case("default")) {
                    args.remove(0);
                }
                Ok(self.set_default(&args))
            }
            Some("reset") => Ok(self.reset().await),
            _ => Ok("Invalid command".to_string()),
        };

        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "command failed");
            format!("Error: {e}")
        })
    }

    /// `mcp connect <id> [command args...]`
    async fn connect(&self, args: &[String]) -> Result<String, CommandError> {
        let Some((id, launch)) = args.split_first() else {
            return Ok("Usage: mcp connect <server-id> [command args...]".to_string());
        };

        let config = match launch.split_first() {
            Some((command, rest)) => ServerConfig::new(command.clone(), rest.to_vec()),
            None => self
                .servers
                .load()?
                .servers
                .remove(id)
                .ok_or_else(|| CommandError::UnknownServer { id: id.clone() })?,
        };

        self.registry.connect(id, &config).await?;
        self.lock_default().get_or_insert_with(|| id.clone());
        self.directory.refresh(&self.registry).await;
        tracing::info!(
            connection = %id,
            tools = self.directory.snapshot().tools_for_connection(id),
            "connection routes refreshed"
        );

        Ok(format!("Connected {id}"))
    }

    /// `mcp disconnect <id>`
    async fn disconnect(&self, args: &[String]) -> Result<String, CommandError> {
        let Some(id) = args.first() else {
            return Ok("Usage: mcp disconnect <server-id>".to_string());
        };

        self.registry.disconnect(id).await;
        let fallback = self.registry.peers().into_iter().next().map(|(id, _)| id);
        {
            let mut default = self.lock_default();
            if default.as_deref() == Some(id.as_str()) {
                tracing::info!(from = %id, to = ?fallback, "default connection reassigned");
                *default = fallback;
            }
        }
        self.directory.refresh(&self.registry).await;

        Ok(format!("Disconnected server: {id}"))
    }

    /// `mcp list`
    fn list(&self) -> String {
        let mut ids = self.registry.list();
        ids.sort();
        format!("Servers: {}", ids.join(", "))
    }

    /// `mcp set-default <id>`, matched case-insensitively.
    fn set_default(&self, args: &[String]) -> String {
        let Some(id) = args.first() else {
            return "Usage: mcp set-default <server-id>".to_string();
        };

        let matched = self
            .registry
            .list()
            .into_iter()
            .find(|existing| existing.eq_ignore_ascii_case(id));

        match matched {
            Some(matched) => {
                *self.lock_default() = Some(matched.clone());
                format!("Default server set to: {matched}")
            }
            None => format!("Server {id} not found"),
        }
    }

    /// `mcp reset`: forget the conversation history.
    async fn reset(&self) -> String {
        let mut conversation = self.conversation.lock().await;
        tracing::info!(turns = conversation.len(), "conversation cleared");
        conversation.clear();
        "Conversation cleared".to_string()
    }

    async fn handle_query(&self, message: &str) -> String {
        if self.default_connection().is_none() {
            return "No MCP server connected".to_string();
        }

        match self.run_query(message).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "query processing failed");
                "Processing failed".to_string()
            }
        }
    }

    async fn run_query(&self, message: &str) -> Result<String, AgentError> {
        let peers = self.registry.peers();
        if peers.is_empty() {
            return Err(AgentError::NoConnections);
        }

        let mut conversation = self.conversation.lock().await;

        // Connections can vanish between refreshes (missed ping, process exit).
        let routed = self.directory.snapshot();
        let stale = routed.is_empty()
            || routed
                .tools()
                .iter()
                .any(|entry| !peers.iter().any(|(id, _)| *id == entry.connection_id));
        if stale {
            tracing::info!("tool routes out of date, refreshing directory");
            self.directory.refresh_from(peers).await;
        }

        let snapshot = self.directory.snapshot();
        let outcome = self
            .orchestrator
            .run(message, &snapshot, &self.registry, &conversation)
            .await?;

        *conversation = outcome.conversation;
        Ok(outcome.reply)
    }

    fn lock_default(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.default_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
