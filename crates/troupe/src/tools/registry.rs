//! Catalog of invocable tools with per-agent scoping.
//!
//! Names are globally unique: builtin names and `<server-id>.<tool-name>`
//! namespaced MCP names form a disjoint union, and an entry is never renamed
//! after registration.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::ToolError;
use crate::models::content::Content;
use crate::models::tool::Tool;

/// Default timeout for subprocess-hosted tools.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<Vec<Content>, ToolError>;
}

/// Adapter so plain async closures can serve as handlers.
pub struct FnToolHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for FnToolHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Vec<Content>, ToolError>> + Send,
{
    async fn call(&self, arguments: Value) -> Result<Vec<Content>, ToolError> {
        (self.0)(arguments).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolSource {
    Builtin,
    Mcp { server: String },
}

/// Which agents may see and call a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentScope {
    All,
    Named(HashSet<String>),
}

impl AgentScope {
    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AgentScope::Named(names.into_iter().map(Into::into).collect())
    }

    pub fn allows(&self, agent: &str) -> bool {
        match self {
            AgentScope::All => true,
            AgentScope::Named(names) => names.contains(agent),
        }
    }
}

#[derive(Clone)]
pub struct ToolEntry {
    pub tool: Tool,
    pub source: ToolSource,
    pub scope: AgentScope,
    pub timeout: Duration,
    handler: Arc<dyn ToolHandler>,
}

impl ToolEntry {
    pub fn builtin(tool: Tool, scope: AgentScope, handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            tool,
            source: ToolSource::Builtin,
            scope,
            timeout: DEFAULT_TOOL_TIMEOUT,
            handler,
        }
    }

    pub fn mcp(
        server: &str,
        tool: Tool,
        scope: AgentScope,
        handler: Arc<dyn ToolHandler>,
        timeout: Duration,
    ) -> Self {
        Self {
            tool,
            source: ToolSource::Mcp {
                server: server.to_string(),
            },
            scope,
            timeout,
            handler,
        }
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    entries: RwLock<HashMap<String, ToolEntry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry. Idempotent when the descriptor is identical to the
    /// existing registration; a conflicting descriptor under the same name
    /// fails.
    pub fn register(&self, entry: ToolEntry) -> Result<(), ToolError> {
        let mut entries = self.entries.write().unwrap();
        if let Some(existing) = entries.get(&entry.tool.name) {
            if existing.tool == entry.tool && existing.source == entry.source {
                return Ok(());
            }
            return Err(ToolError::DuplicateTool(entry.tool.name.clone()));
        }
        entries.insert(entry.tool.name.clone(), entry);
        Ok(())
    }

    /// Remove every tool published by an MCP server. Returns the removed
    /// names so adapters can drop their schemas too.
    pub fn unregister_server(&self, server: &str) -> Vec<String> {
        let mut entries = self.entries.write().unwrap();
        let removed: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| {
                matches!(&entry.source, ToolSource::Mcp { server: s } if s == server)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in &removed {
            entries.remove(name);
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Tool> {
        self.entries
            .read()
            .unwrap()
            .get(name)
            .map(|entry| entry.tool.clone())
    }

    /// Like `get`, but only if the tool is enabled for the named agent.
    pub fn get_for(&self, name: &str, agent: &str) -> Option<Tool> {
        self.entries
            .read()
            .unwrap()
            .get(name)
            .filter(|entry| entry.scope.allows(agent))
            .map(|entry| entry.tool.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().unwrap().contains_key(name)
    }

    /// Tools visible to the named agent, in name order.
    pub fn list_for(&self, agent: &str) -> Vec<Tool> {
        let entries = self.entries.read().unwrap();
        let mut tools: Vec<Tool> = entries
            .values()
            .filter(|entry| entry.scope.allows(agent))
            .map(|entry| entry.tool.clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Invoke a tool. Never fatal: unknown names, handler failures, and
    /// timeouts all come back as an error result for the model to see.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<Vec<Content>, ToolError> {
        let (handler, timeout) = {
            let entries = self.entries.read().unwrap();
            match entries.get(name) {
                Some(entry) => (Arc::clone(&entry.handler), entry.timeout),
                None => return Err(ToolError::NotFound(name.to_string())),
            }
        };

        match tokio::time::timeout(timeout, handler.call(arguments)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout(name.to_string())),
        }
    }
}
