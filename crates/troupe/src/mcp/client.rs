//! Stdio MCP client: subprocess lifecycle, initialize handshake, tool
//! discovery, and JSON-RPC request dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex, Notify};

use super::config::McpServerConfig;
use super::protocol::*;

const INIT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum McpError {
    #[error("failed to spawn MCP server: {0}")]
    SpawnFailed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("MCP server error: {0}")]
    Rpc(JsonRpcError),

    #[error("MCP request timed out")]
    Timeout,

    #[error("MCP server disconnected")]
    Disconnected,
}

/// State shared between the client handle and its reader task.
struct Shared {
    server_id: String,
    writer: Mutex<BufWriter<ChildStdin>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    next_id: AtomicU64,
    disconnected: AtomicBool,
    disconnect_notify: Notify,
}

impl Shared {
    fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
        self.disconnect_notify.notify_waiters();
    }

    async fn fail_pending(&self) {
        self.pending.lock().await.clear();
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(McpError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        {
            let mut writer = self.writer.lock().await;
            let line = serde_json::to_string(&request)?;
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }

        let response = tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| McpError::Timeout)?
            .map_err(|_| McpError::Disconnected)?;
        response.into_result().map_err(McpError::Rpc)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(McpError::Disconnected);
        }
        let notification = JsonRpcNotification::new(method, params);
        let mut writer = self.writer.lock().await;
        let line = serde_json::to_string(&notification)?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

/// An active connection to one MCP server subprocess.
pub struct McpClient {
    shared: Arc<Shared>,
    server_info: ServerInfo,
    child: Mutex<Option<Child>>,
}

impl McpClient {
    /// Spawn the subprocess, start the reader loop, and perform the
    /// initialize handshake.
    pub async fn connect(server_id: &str, config: &McpServerConfig) -> Result<Self, McpError> {
        let mut command = Command::new(&config.command);
        command.args(&config.args);
        for (key, value) in &config.env {
            command.env(key, value);
        }
        command.stdin(std::process::Stdio::piped());
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::null());
        command.kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| McpError::SpawnFailed(format!("{}: {e}", config.command)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::SpawnFailed("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::SpawnFailed("failed to capture stdout".into()))?;

        let shared = Arc::new(Shared {
            server_id: server_id.to_string(),
            writer: Mutex::new(BufWriter::new(stdin)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            disconnected: AtomicBool::new(false),
            disconnect_notify: Notify::new(),
        });
        spawn_reader_loop(Arc::clone(&shared), BufReader::new(stdout));

        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: ClientInfo {
                name: "troupe".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let raw = tokio::time::timeout(
            INIT_TIMEOUT,
            shared.request("initialize", Some(serde_json::to_value(&params)?)),
        )
        .await
        .map_err(|_| McpError::Timeout)??;
        let init: InitializeResult = serde_json::from_value(raw)?;

        if init.protocol_version != MCP_PROTOCOL_VERSION {
            tracing::warn!(
                server = server_id,
                theirs = %init.protocol_version,
                ours = MCP_PROTOCOL_VERSION,
                "MCP protocol version mismatch, proceeding leniently"
            );
        }
        shared.notify("notifications/initialized", None).await?;

        tracing::info!(
            server = server_id,
            name = %init.server_info.name,
            version = %init.server_info.version,
            "MCP server connected"
        );

        Ok(Self {
            shared,
            server_info: init.server_info,
            child: Mutex::new(Some(child)),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.disconnected.load(Ordering::Acquire)
    }

    /// Resolves once the subprocess goes away (EOF on stdout or read error).
    pub async fn disconnected(&self) {
        if !self.is_connected() {
            return;
        }
        self.shared.disconnect_notify.notified().await;
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>, McpError> {
        let raw = self.shared.request("tools/list", None).await?;
        let list: ToolsListResult = serde_json::from_value(raw)?;
        Ok(list.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        let params = json!({"name": name, "arguments": arguments});
        let raw = self.shared.request("tools/call", Some(params)).await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Close stdin, wait briefly for exit, then kill.
    pub async fn shutdown(&self) {
        {
            let mut writer = self.shared.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        let mut child = self.child.lock().await;
        if let Some(ref mut child) = *child {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await;
            let _ = child.kill().await;
        }
        *child = None;
        self.shared.mark_disconnected();
        self.shared.fail_pending().await;
    }
}

/// Read JSON-RPC lines from the server's stdout, dispatching responses to
/// their waiting requests. EOF or a read error marks the client disconnected
/// and fails every pending request.
fn spawn_reader_loop(shared: Arc<Shared>, reader: BufReader<ChildStdout>) {
    tokio::spawn(async move {
        let mut reader = reader;
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    tracing::info!(server = %shared.server_id, "MCP server disconnected (EOF)");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match ServerMessage::from_line(trimmed) {
                        Ok(ServerMessage::Response(response)) => {
                            if let Some(id) = response.id.as_u64() {
                                if let Some(tx) = shared.pending.lock().await.remove(&id) {
                                    let _ = tx.send(response);
                                }
                            }
                        }
                        Ok(ServerMessage::Notification(notification)) => {
                            tracing::debug!(
                                server = %shared.server_id,
                                method = %notification.method,
                                "MCP notification"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(
                                server = %shared.server_id,
                                "failed to parse MCP message: {e}: {trimmed}"
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %shared.server_id, "MCP read error: {e}");
                    break;
                }
            }
        }
        shared.mark_disconnected();
        shared.fail_pending().await;
    });
}
