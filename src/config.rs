//! Relay configuration.
//!
//! `config.yaml` holds the model, orchestrator and connection settings;
//! peer launch specs live in a separate `mcp-servers.json`. Both files go
//! through `${VAR}` / `${VAR:-default}` interpolation before parsing, and a
//! missing file means defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::agent_core::orchestrator::{
    OrchestratorSettings, DEFAULT_MAX_TOOL_CALLS, DEFAULT_RESPONSE_HINT,
};
use crate::inference::config::{expand_tilde, interpolate_env_vars};
use crate::inference::ModelConfig;
use crate::mcp_client::{McpServersConfig, RegistrySettings};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "MCP_RELAY_CONFIG";

pub const CONFIG_FILE_NAME: &str = "config.yaml";
pub const SERVERS_FILE_NAME: &str = "mcp-servers.json";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid YAML in '{path}': {source}")]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("invalid JSON in '{path}': {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid value in '{path}': {field} must be greater than zero")]
    ZeroDuration { path: String, field: &'static str },
}

// ─── Sections ────────────────────────────────────────────────────────────────

/// `orchestrator:` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_tool_calls: usize,
    pub response_hint: String,
    pub model_timeout_secs: u64,
    pub tool_timeout_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        let defaults = OrchestratorSettings::default();
        Self {
            max_tool_calls: DEFAULT_MAX_TOOL_CALLS,
            response_hint: DEFAULT_RESPONSE_HINT.to_string(),
            model_timeout_secs: defaults.model_timeout.as_secs(),
            tool_timeout_secs: defaults.tool_timeout.as_secs(),
        }
    }
}

impl OrchestratorSection {
    pub fn to_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_tool_calls: self.max_tool_calls,
            response_hint: self.response_hint.clone(),
            model_timeout: Duration::from_secs(self.model_timeout_secs),
            tool_timeout: Duration::from_secs(self.tool_timeout_secs),
        }
    }
}

/// `connections:` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectionsSection {
    pub handshake_timeout_secs: u64,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ConnectionsSection {
    fn default() -> Self {
        let defaults = RegistrySettings::default();
        Self {
            handshake_timeout_secs: defaults.handshake_timeout.as_secs(),
            probe_interval_secs: defaults.probe_interval.as_secs(),
            probe_timeout_secs: defaults.probe_timeout.as_secs(),
            request_timeout_secs: defaults.request_timeout.as_secs(),
        }
    }
}

impl ConnectionsSection {
    pub fn to_settings(&self) -> RegistrySettings {
        RegistrySettings {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            probe_interval: Duration::from_secs(self.probe_interval_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

// ─── RelayConfig ─────────────────────────────────────────────────────────────

/// Contents of `config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub model: ModelConfig,
    pub orchestrator: OrchestratorSection,
    pub connections: ConnectionsSection,
    /// Peer launch specs. Relative paths are resolved against the config
    /// file's directory; unset means `mcp-servers.json` next to it.
    pub servers_file: Option<PathBuf>,
}

impl RelayConfig {
    /// Load from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let Some(content) = read_optional(path)? else {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        };

        let content = interpolate_env_vars(&content);
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
            path: path.display().to_string(),
            source,
        })?;
        config.validate().map_err(|field| ConfigError::ZeroDuration {
            path: path.display().to_string(),
            field,
        })?;
        tracing::info!(
            path = %path.display(),
            model = %config.model.model_name,
            max_tool_calls = config.orchestrator.max_tool_calls,
            "loaded relay config"
        );
        Ok(config)
    }

    /// Name of the first timeout or interval set to zero, if any.
    fn validate(&self) -> Result<(), &'static str> {
        let fields = [
            ("orchestrator.model_timeout_secs", self.orchestrator.model_timeout_secs),
            ("orchestrator.tool_timeout_secs", self.orchestrator.tool_timeout_secs),
            ("connections.handshake_timeout_secs", self.connections.handshake_timeout_secs),
            ("connections.probe_interval_secs", self.connections.probe_interval_secs),
            ("connections.probe_timeout_secs", self.connections.probe_timeout_secs),
            ("connections.request_timeout_secs", self.connections.request_timeout_secs),
        ];
        match fields.iter().find(|(_, secs)| *secs == 0) {
            Some((field, _)) => Err(*field),
            None => Ok(()),
        }
    }

    /// Where the peer launch specs live, given the config file's directory.
    pub fn servers_path(&self, config_dir: &Path) -> PathBuf {
        match &self.servers_file {
            Some(file) => {
                let file = PathBuf::from(expand_tilde(&file.to_string_lossy()));
                if file.is_absolute() {
                    file
                } else {
                    config_dir.join(file)
                }
            }
            None => config_dir.join(SERVERS_FILE_NAME),
        }
    }
}

/// Config file path: the explicit one, else `$MCP_RELAY_CONFIG`, else
/// `config.yaml` in the data directory.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| {
            std::env::var(CONFIG_ENV)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| PathBuf::from(expand_tilde(&v)))
        })
        .unwrap_or_else(|| crate::data_dir().join(CONFIG_FILE_NAME))
}

/// Load peer launch specs. A missing file yields an empty set.
pub fn load_servers_file(path: &Path) -> Result<McpServersConfig, ConfigError> {
    let Some(content) = read_optional(path)? else {
        tracing::info!(path = %path.display(), "no MCP servers file");
        return Ok(McpServersConfig::default());
    };

    let content = interpolate_env_vars(&content);
    let mut config: McpServersConfig =
        serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path.display().to_string(),
            source,
        })?;

    for server in config.servers.values_mut() {
        if let Some(cwd) = server.cwd.as_mut() {
            *cwd = expand_tilde(cwd);
        }
    }

    tracing::info!(
        path = %path.display(),
        count = config.servers.len(),
        servers = ?config.servers.keys().collect::<Vec<_>>(),
        "loaded MCP servers file"
    );
    Ok(config)
}

fn read_optional(path: &Path) -> Result<Option<String>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Read {
            path: path.display().to_string(),
            source,
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
