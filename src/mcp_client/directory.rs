//! Tool directory: aggregates tool listings across all connected peers.
//!
//! Provides:
//! - Validation of raw `tools/list` entries into typed [`ToolDefinition`]s
//! - A routing table from tool name to owning connection id
//! - Immutable snapshots for the orchestrator to read without locking
//!
//! The directory is rebuilt wholesale on every refresh. When two peers expose
//! the same tool name, the peer listed first (lowest generation) keeps it.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::client::McpPeer;
use super::errors::McpError;
use super::registry::ConnectionRegistry;
use super::types::{InputSchema, ToolDefinition};

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// One tool in the flattened catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub connection_id: String,
    pub definition: ToolDefinition,
}

/// Immutable view of the directory at one refresh.
#[derive(Debug, Clone, Default)]
pub struct DirectorySnapshot {
    /// Catalog in merge order (peer order, then listing order).
    tools: Vec<CatalogEntry>,
    /// `tool_name → connection_id`.
    routes: BTreeMap<String, String>,
}

impl DirectorySnapshot {
    /// Owning connection for a tool name.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.routes.get(name).map(String::as_str)
    }

    pub fn tools(&self) -> &[CatalogEntry] {
        &self.tools
    }

    /// Tool names, sorted.
    pub fn tool_names(&self) -> Vec<&str> {
        self.routes.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Number of tools routed to `connection_id`.
    pub fn tools_for_connection(&self, connection_id: &str) -> usize {
        self.routes
            .values()
            .filter(|owner| owner.as_str() == connection_id)
            .count()
    }

    fn insert(&mut self, connection_id: &str, definition: ToolDefinition) -> bool {
        if self.routes.contains_key(&definition.name) {
            return false;
        }
        self.routes
            .insert(definition.name.clone(), connection_id.to_string());
        self.tools.push(CatalogEntry {
            connection_id: connection_id.to_string(),
            definition,
        });
        true
    }
}

// ─── ToolDirectory ───────────────────────────────────────────────────────────

/// Shared, atomically swapped tool directory.
#[derive(Debug, Default)]
pub struct ToolDirectory {
    current: RwLock<Arc<DirectorySnapshot>>,
}

impl ToolDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from every connected peer in `registry`.
    pub async fn refresh(&self, registry: &ConnectionRegistry) -> usize {
        self.refresh_from(registry.peers()).await
    }

    /// Rebuild from an explicit peer list, in the given order.
    ///
    /// Peers are listed concurrently. A peer whose listing fails or does not
    /// validate contributes nothing; the refresh itself never fails. Returns
    /// the number of tools in the new snapshot.
    pub async fn refresh_from(&self, peers: Vec<(String, Arc<dyn McpPeer>)>) -> usize {
        let listings = futures::future::join_all(peers.iter().map(|(id, peer)| async move {
            let listing = peer.list_tools().await;
            (id.as_str(), listing)
        }))
        .await;

        let mut snapshot = DirectorySnapshot::default();
        for (id, listing) in listings {
            let raw = match listing {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(connection = id, error = %e, "tools/list failed, skipping connection");
                    continue;
                }
            };

            let tools = match validate_listing(id, &raw) {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::warn!(connection = id, error = %e, "malformed tool listing, skipping connection");
                    continue;
                }
            };

            let offered = tools.len();
            let mut accepted = 0usize;
            for tool in tools {
                let name = tool.name.clone();
                if snapshot.insert(id, tool) {
                    accepted += 1;
                } else {
                    tracing::debug!(
                        connection = id,
                        tool = %name,
                        owner = snapshot.lookup(&name).unwrap_or_default(),
                        "duplicate tool name ignored"
                    );
                }
            }
            tracing::debug!(connection = id, offered, accepted, "registered tools");
        }

        let count = snapshot.len();
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(snapshot);
        tracing::info!(tools = count, peers = peers.len(), "tool directory refreshed");
        count
    }

    /// Current snapshot; unaffected by later refreshes.
    pub fn snapshot(&self) -> Arc<DirectorySnapshot> {
        Arc::clone(
            &self
                .current
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        self.snapshot().lookup(name).map(str::to_string)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Validate a whole listing; one bad entry rejects the listing.
pub fn validate_listing(
    server: &str,
    raw: &[serde_json::Value],
) -> Result<Vec<ToolDefinition>, McpError> {
    raw.iter()
        .enumerate()
        .map(|(index, value)| {
            validate_tool(value).map_err(|reason| McpError::InvalidResponse {
                server: server.to_string(),
                reason: format!("tool #{index}: {reason}"),
            })
        })
        .collect()
}

fn validate_tool(value: &serde_json::Value) -> Result<ToolDefinition, String> {
    let obj = value.as_object().ok_or("tool entry is not an object")?;

    let name = obj
        .get("name")
        .and_then(|n| n.as_str())
        .filter(|n| !n.trim().is_empty())
        .ok_or("missing or empty 'name'")?;

    let description = match obj.get("description") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(format!("'{name}': 'description' is not a string")),
    };

    let input_schema = match obj.get("inputSchema") {
        None | Some(serde_json::Value::Null) => InputSchema::default(),
        Some(schema) => validate_schema(schema).map_err(|reason| format!("'{name}': {reason}"))?,
    };

    Ok(ToolDefinition {
        name: name.to_string(),
        description,
        input_schema,
    })
}

fn validate_schema(schema: &serde_json::Value) -> Result<InputSchema, String> {
    let obj = schema.as_object().ok_or("'inputSchema' is not an object")?;

    if let Some(ty) = obj.get("type") {
        if ty.as_str() != Some("object") {
            return Err(format!("'inputSchema.type' must be \"object\", got {ty}"));
        }
    }

    let properties = match obj.get("properties") {
        None | Some(serde_json::Value::Null) => serde_json::Map::new(),
        Some(serde_json::Value::Object(map)) => map.clone(),
        Some(_) => return Err("'inputSchema.properties' is not an object".into()),
    };

    let required = match obj.get("required") {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(serde_json::Value::Array(items)) => {
            let mut names = Vec::with_capacity(items.len());
            for item in items {
                let field = item
                    .as_str()
                    .ok_or("'inputSchema.required' contains a non-string")?;
                if !properties.contains_key(field) {
                    return Err(format!("required parameter '{field}' is not declared"));
                }
                names.push(field.to_string());
            }
            names
        }
        Some(_) => return Err("'inputSchema.required' is not a list".into()),
    };

    Ok(InputSchema {
        properties,
        required,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::CallToolResult;
    use async_trait::async_trait;
    use serde_json::json;

    struct StaticPeer {
        listing: Option<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl McpPeer for StaticPeer {
        async fn list_tools(&self) -> Result<Vec<serde_json::Value>, McpError> {
            self.listing.clone().ok_or(McpError::TransportError {
                server: "static".into(),
                reason: "server stdout closed".into(),
            })
        }

        async fn call_tool(
            &self,
            _name: &str,
            _arguments: serde_json::Value,
        ) -> Result<CallToolResult, McpError> {
            Ok(CallToolResult::default())
        }

        async fn ping(&self) -> Result<(), McpError> {
            Ok(())
        }
    }

    fn peer(id: &str, listing: Option<Vec<serde_json::Value>>) -> (String, Arc<dyn McpPeer>) {
        (id.to_string(), Arc::new(StaticPeer { listing }))
    }

    fn tool(name: &str) -> serde_json::Value {
        json!({
            "name": name,
            "description": format!("{name} tool"),
            "inputSchema": {
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }
        })
    }

    #[tokio::test]
    async fn test_refresh_routes_tools_to_owners() {
        let directory = ToolDirectory::new();
        let count = directory
            .refresh_from(vec![
                peer("files", Some(vec![tool("read_file"), tool("write_file")])),
                peer("web", Some(vec![tool("fetch")])),
            ])
            .await;

        assert_eq!(count, 3);
        assert_eq!(directory.lookup("read_file").as_deref(), Some("files"));
        assert_eq!(directory.lookup("fetch").as_deref(), Some("web"));
        assert!(directory.lookup("delete_everything").is_none());

        let snapshot = directory.snapshot();
        assert_eq!(snapshot.tool_names(), vec!["fetch", "read_file", "write_file"]);
        assert_eq!(snapshot.tools_for_connection("files"), 2);
        assert_eq!(snapshot.tools()[0].definition.input_schema.required, vec!["path"]);
    }

    #[tokio::test]
    async fn test_first_peer_wins_duplicate_names() {
        let directory = ToolDirectory::new();
        directory
            .refresh_from(vec![
                peer("first", Some(vec![tool("search")])),
                peer("second", Some(vec![tool("search"), tool("other")])),
            ])
            .await;

        assert_eq!(directory.lookup("search").as_deref(), Some("first"));
        assert_eq!(directory.lookup("other").as_deref(), Some("second"));
        assert_eq!(directory.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_listing_contributes_nothing() {
        let directory = ToolDirectory::new();
        let count = directory
            .refresh_from(vec![peer("down", None), peer("up", Some(vec![tool("ok")]))])
            .await;

        assert_eq!(count, 1);
        assert_eq!(directory.lookup("ok").as_deref(), Some("up"));
    }

    #[tokio::test]
    async fn test_malformed_listing_skips_whole_connection() {
        let directory = ToolDirectory::new();
        let bad = vec![
            tool("fine"),
            json!({"name": "broken", "inputSchema": {"type": "object", "required": ["ghost"]}}),
        ];
        directory
            .refresh_from(vec![peer("bad", Some(bad)), peer("good", Some(vec![tool("solid")]))])
            .await;

        assert!(directory.lookup("fine").is_none());
        assert!(directory.lookup("broken").is_none());
        assert_eq!(directory.lookup("solid").as_deref(), Some("good"));
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot_wholesale() {
        let directory = ToolDirectory::new();
        directory
            .refresh_from(vec![peer("a", Some(vec![tool("old")]))])
            .await;
        let before = directory.snapshot();

        directory
            .refresh_from(vec![peer("b", Some(vec![tool("new")]))])
            .await;

        assert!(directory.lookup("old").is_none());
        assert_eq!(directory.lookup("new").as_deref(), Some("b"));
        // Snapshots taken earlier are unaffected.
        assert_eq!(before.lookup("old"), Some("a"));
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let directory = ToolDirectory::new();
        let peers = || {
            vec![
                peer("x", Some(vec![tool("b"), tool("a")])),
                peer("y", Some(vec![tool("a"), tool("c")])),
            ]
        };

        directory.refresh_from(peers()).await;
        let first = directory.snapshot();
        directory.refresh_from(peers()).await;
        let second = directory.snapshot();

        assert_eq!(first.tools(), second.tools());
        assert_eq!(first.tool_names(), second.tool_names());
        for name in first.tool_names() {
            assert_eq!(first.lookup(name), second.lookup(name));
        }
    }

    #[tokio::test]
    async fn test_refresh_with_no_peers_empties_directory() {
        let directory = ToolDirectory::new();
        directory
            .refresh_from(vec![peer("a", Some(vec![tool("x")]))])
            .await;
        directory.refresh_from(Vec::new()).await;
        assert!(directory.is_empty());
    }

    #[test]
    fn test_validate_tool_without_schema() {
        let def = validate_tool(&json!({"name": "now"})).unwrap();
        assert_eq!(def.name, "now");
        assert!(def.description.is_none());
        assert!(def.input_schema.properties.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        assert!(validate_tool(&json!("just a string")).is_err());
        assert!(validate_tool(&json!({"name": ""})).is_err());
        assert!(validate_tool(&json!({"name": "x", "description": 5})).is_err());
        assert!(validate_tool(&json!({"name": "x", "inputSchema": {"type": "array"}})).is_err());
        assert!(validate_tool(&json!({"name": "x", "inputSchema": {"properties": []}})).is_err());
        assert!(validate_tool(&json!({"name": "x", "inputSchema": {"required": "path"}})).is_err());
        assert!(validate_tool(
            &json!({"name": "x", "inputSchema": {"properties": {"a": {}}, "required": [1]}})
        )
        .is_err());
    }

    #[test]
    fn test_validate_listing_reports_index() {
        let err = validate_listing("srv", &[tool("ok"), json!(42)]).unwrap_err();
        assert!(err.to_string().contains("tool #1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_refresh_from_live_registry() {
        use crate::mcp_client::registry::RegistrySettings;
        use crate::mcp_client::test_support::fake_peer;

        let dir = tempfile::tempdir().unwrap();
        let registry = ConnectionRegistry::new(RegistrySettings::default());
        registry
            .connect("echo-srv", &fake_peer(dir.path(), &[]))
            .await
            .unwrap();

        let directory = ToolDirectory::new();
        assert_eq!(directory.refresh(&registry).await, 1);
        assert_eq!(directory.lookup("echo").as_deref(), Some("echo-srv"));

        registry.shutdown().await;
    }
}
