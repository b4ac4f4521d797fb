//! Launches and supervises MCP server subprocesses, republishing their tools
//! into the tool registry under `<server-id>.<tool-name>` names.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::client::{McpClient, McpError};
use super::config::McpServersFile;
use super::protocol::ToolCallContent;
use crate::errors::ToolError;
use crate::models::content::Content;
use crate::models::tool::Tool;
use crate::tools::registry::{
    AgentScope, FnToolHandler, ToolEntry, ToolHandler, ToolRegistry, DEFAULT_TOOL_TIMEOUT,
};

enum ServerState {
    Connected(Arc<McpClient>),
    Disconnected,
}

pub struct McpSupervisor {
    registry: Arc<ToolRegistry>,
    manifest: McpServersFile,
    servers: Mutex<HashMap<String, ServerState>>,
}

/// Marshals a registry invocation over the subprocess transport.
struct McpProxyHandler {
    client: Arc<McpClient>,
    server_id: String,
    tool_name: String,
}

#[async_trait]
impl ToolHandler for McpProxyHandler {
    async fn call(&self, arguments: Value) -> Result<Vec<Content>, ToolError> {
        match self.client.call_tool(&self.tool_name, arguments).await {
            Ok(result) => {
                let contents: Vec<Content> = result
                    .content
                    .into_iter()
                    .map(|c| match c {
                        ToolCallContent::Text { text } => Content::text(text),
                        ToolCallContent::Image { data, mime_type } => {
                            Content::image(data, mime_type)
                        }
                    })
                    .collect();
                if result.is_error {
                    let text = contents
                        .iter()
                        .filter_map(Content::as_text)
                        .collect::<Vec<_>>()
                        .join("\n");
                    Err(ToolError::Execution(text))
                } else {
                    Ok(contents)
                }
            }
            Err(McpError::Disconnected) => Err(ToolError::ServerDown(self.server_id.clone())),
            Err(McpError::Timeout) => Err(ToolError::Timeout(self.tool_name.clone())),
            Err(e) => Err(ToolError::Execution(e.to_string())),
        }
    }
}

impl McpSupervisor {
    pub fn new(manifest: McpServersFile, registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            manifest,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Launch every configured server concurrently. A failure of one does
    /// not abort the others; failed servers are recorded as disconnected.
    pub async fn start_all(self: &Arc<Self>) {
        let ids: Vec<String> = self.manifest.servers.keys().cloned().collect();
        let launches = ids.into_iter().map(|id| {
            let supervisor = Arc::clone(self);
            async move {
                if let Err(e) = supervisor.launch(&id).await {
                    tracing::warn!(server = %id, "MCP server failed to start: {e}");
                    supervisor
                        .servers
                        .lock()
                        .await
                        .insert(id.clone(), ServerState::Disconnected);
                }
            }
        });
        futures::future::join_all(launches).await;
    }

    /// Spawn one server, discover its tools, and register them.
    async fn launch(self: &Arc<Self>, server_id: &str) -> Result<usize, McpError> {
        let config = self
            .manifest
            .servers
            .get(server_id)
            .ok_or_else(|| McpError::SpawnFailed(format!("unknown server '{server_id}'")))?
            .clone();

        let client = Arc::new(McpClient::connect(server_id, &config).await?);
        let tools = client.list_tools().await?;
        let count = tools.len();

        let scope = if config.enabled_for_agents.is_empty() {
            AgentScope::All
        } else {
            AgentScope::named(config.enabled_for_agents.clone())
        };

        for def in tools {
            let namespaced = format!("{server_id}.{}", def.name);
            let entry = ToolEntry::mcp(
                server_id,
                Tool::new(
                    namespaced.clone(),
                    def.description.unwrap_or_default(),
                    def.input_schema,
                ),
                scope.clone(),
                Arc::new(McpProxyHandler {
                    client: Arc::clone(&client),
                    server_id: server_id.to_string(),
                    tool_name: def.name,
                }),
                DEFAULT_TOOL_TIMEOUT,
            );
            if let Err(e) = self.registry.register(entry) {
                tracing::warn!(tool = %namespaced, "skipping MCP tool: {e}");
            }
        }

        tracing::info!(server = server_id, tools = count, "MCP server ready");
        self.servers.lock().await.insert(
            server_id.to_string(),
            ServerState::Connected(Arc::clone(&client)),
        );
        self.watch(server_id.to_string(), client);
        Ok(count)
    }

    /// On subprocess death, unregister the server's tools and record it as
    /// disconnected. Reconnection is manual, via the `mcp_reconnect` tool.
    fn watch(self: &Arc<Self>, server_id: String, client: Arc<McpClient>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            client.disconnected().await;
            let removed = supervisor.registry.unregister_server(&server_id);
            tracing::warn!(
                server = %server_id,
                tools = removed.len(),
                "MCP server exited, tools unregistered"
            );
            supervisor
                .servers
                .lock()
                .await
                .insert(server_id, ServerState::Disconnected);
        });
    }

    /// Manually respawn a server that exited.
    pub async fn reconnect(self: &Arc<Self>, server_id: &str) -> Result<usize, McpError> {
        if let Some(ServerState::Connected(client)) =
            self.servers.lock().await.remove(server_id)
        {
            client.shutdown().await;
        }
        self.registry.unregister_server(server_id);
        self.launch(server_id).await
    }

    /// (server id, connected) pairs for status display.
    pub async fn statuses(&self) -> Vec<(String, bool)> {
        let servers = self.servers.lock().await;
        let mut statuses: Vec<(String, bool)> = servers
            .iter()
            .map(|(id, state)| (id.clone(), matches!(state, ServerState::Connected(_))))
            .collect();
        statuses.sort();
        statuses
    }

    pub async fn shutdown_all(&self) {
        let mut servers = self.servers.lock().await;
        for (id, state) in servers.drain() {
            if let ServerState::Connected(client) = state {
                tracing::info!(server = %id, "shutting down MCP server");
                client.shutdown().await;
            }
        }
    }

    /// Register the builtin `mcp_reconnect` tool against this supervisor.
    pub fn register_reconnect_tool(self: &Arc<Self>) -> Result<(), ToolError> {
        let supervisor = Arc::clone(self);
        self.registry.register(ToolEntry::builtin(
            Tool::new(
                "mcp_reconnect",
                "Reconnect a disconnected MCP tool server by id.",
                json!({
                    "type": "object",
                    "properties": {
                        "server": {"type": "string", "description": "Server id from the MCP manifest"}
                    },
                    "required": ["server"]
                }),
            ),
            AgentScope::All,
            Arc::new(FnToolHandler(move |arguments: Value| {
                let supervisor = Arc::clone(&supervisor);
                async move {
                    let server = arguments["server"]
                        .as_str()
                        .ok_or_else(|| {
                            ToolError::InvalidParameters("missing 'server'".to_string())
                        })?
                        .to_string();
                    match supervisor.reconnect(&server).await {
                        Ok(count) => Ok(vec![Content::text(format!(
                            "reconnected '{server}' with {count} tools"
                        ))]),
                        Err(e) => Err(ToolError::Execution(e.to_string())),
                    }
                }
            })),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MOCK_SERVER: &str = r#"#!/bin/sh
while IFS= read -r line; do
    case "$line" in
        *'"initialize"'*)
            id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
            printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fs","version":"1.0.0"}}}\n' "$id"
            ;;
        *'"tools/list"'*)
            id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
            printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"read","description":"Read a file","inputSchema":{"type":"object"}}]}}\n' "$id"
            ;;
        *'"crash"'*)
            exit 1
            ;;
        *'"tools/call"'*)
            id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
            printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"file contents"}],"isError":false}}\n' "$id"
            ;;
    esac
done
"#;

    fn manifest(dir: &std::path::Path) -> McpServersFile {
        let script = dir.join("mock_mcp.sh");
        std::fs::write(&script, MOCK_SERVER).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        serde_json::from_value(json!({
            "fs": {
                "name": "Filesystem",
                "command": "sh",
                "args": [script.to_string_lossy()],
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_all_registers_namespaced_tools() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new());
        let supervisor = Arc::new(McpSupervisor::new(manifest(dir.path()), Arc::clone(&registry)));
        supervisor.start_all().await;

        assert!(registry.contains("fs.read"));
        let result = registry.invoke("fs.read", json!({"path": "/x"})).await.unwrap();
        assert_eq!(result[0].as_text(), Some("file contents"));
        assert_eq!(supervisor.statuses().await, vec![("fs".to_string(), true)]);

        supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_crash_unregisters_tools() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new());
        let supervisor = Arc::new(McpSupervisor::new(manifest(dir.path()), Arc::clone(&registry)));
        supervisor.start_all().await;

        // The crash tool makes the subprocess exit mid-call
        let result = registry.invoke("fs.crash", json!({})).await;
        assert!(matches!(result, Err(ToolError::NotFound(_))));
        let result = registry.invoke("fs.read", json!({"crash": true})).await;
        assert!(
            matches!(result, Err(ToolError::ServerDown(ref s)) if s == "fs"),
            "expected ServerDown, got {result:?}"
        );

        // The death watcher unregisters the server's tools
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!registry.contains("fs.read"));
        assert_eq!(supervisor.statuses().await, vec![("fs".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_reconnect_restores_tools() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ToolRegistry::new());
        let supervisor = Arc::new(McpSupervisor::new(manifest(dir.path()), Arc::clone(&registry)));
        supervisor.start_all().await;
        supervisor.register_reconnect_tool().unwrap();

        let _ = registry.invoke("fs.read", json!({"crash": true})).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!registry.contains("fs.read"));

        let result = registry
            .invoke("mcp_reconnect", json!({"server": "fs"}))
            .await
            .unwrap();
        assert!(result[0].as_text().unwrap().contains("reconnected"));
        assert!(registry.contains("fs.read"));

        supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_others() {
        let dir = tempfile::tempdir().unwrap();
        let mut servers = manifest(dir.path());
        servers.servers.insert(
            "broken".to_string(),
            super::super::config::McpServerConfig {
                name: "Broken".to_string(),
                command: "__no_such_binary__".to_string(),
                args: vec![],
                env: HashMap::new(),
                enabled_for_agents: Vec::new(),
            },
        );

        let registry = Arc::new(ToolRegistry::new());
        let supervisor = Arc::new(McpSupervisor::new(servers, Arc::clone(&registry)));
        supervisor.start_all().await;

        assert!(registry.contains("fs.read"));
        let statuses = supervisor.statuses().await;
        assert_eq!(
            statuses,
            vec![("broken".to_string(), false), ("fs".to_string(), true)]
        );

        supervisor.shutdown_all().await;
    }
}
