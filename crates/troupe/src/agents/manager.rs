//! Registry of agents, the current-agent pointer, and the orchestration of
//! selection, model switches, and transfers. The manager owns the provider
//! adapter; agents never hold back-pointers to it.

use std::collections::HashMap;
use std::sync::Arc;

use super::agent::{Agent, AgentSummary};
use crate::config::{AgentsFile, GlobalConfig};
use crate::errors::{ConfigError, Error, TransferError};
use crate::models::message::Message;
use crate::providers::base::{Provider, ThinkingLevel};
use crate::providers::factory;
use crate::registry::ModelRegistry;
use crate::tools::registry::ToolRegistry;
use crate::tools::transfer::TransferArgs;

pub struct AgentManager {
    agents: Vec<Agent>,
    current: Option<usize>,
    provider: Box<dyn Provider>,
    registry: Arc<ToolRegistry>,
    models: Arc<ModelRegistry>,
    config: GlobalConfig,
}

impl AgentManager {
    /// Build the roster from configuration. Unknown builtin tool names are a
    /// configuration error; namespaced MCP names are tolerated with a
    /// warning, since their server may simply be down right now.
    pub fn new(
        agents_file: AgentsFile,
        provider: Box<dyn Provider>,
        registry: Arc<ToolRegistry>,
        models: Arc<ModelRegistry>,
        config: GlobalConfig,
    ) -> Result<Self, ConfigError> {
        let mut agents = Vec::new();
        for agent_config in agents_file.agents {
            for tool in &agent_config.tools {
                if !registry.contains(tool) {
                    if tool.contains('.') {
                        tracing::warn!(
                            agent = %agent_config.name,
                            tool = %tool,
                            "MCP tool not currently registered"
                        );
                    } else {
                        return Err(ConfigError::UnknownTool {
                            agent: agent_config.name.clone(),
                            tool: tool.clone(),
                        });
                    }
                }
            }
            agents.push(Agent::from_config(agent_config));
        }

        Ok(Self {
            agents,
            current: None,
            provider,
            registry,
            models,
            config,
        })
    }

    pub fn roster(&self) -> Vec<AgentSummary> {
        self.agents.iter().map(Agent::summary).collect()
    }

    pub fn agent(&self, name: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn agent_mut(&mut self, name: &str) -> Option<&mut Agent> {
        self.agents.iter_mut().find(|a| a.name == name)
    }

    pub fn current_agent(&self) -> Option<&Agent> {
        self.current.map(|i| &self.agents[i])
    }

    pub fn current_agent_mut(&mut self) -> Option<&mut Agent> {
        self.current.map(move |i| &mut self.agents[i])
    }

    pub fn current_name(&self) -> Option<&str> {
        self.current_agent().map(|a| a.name.as_str())
    }

    pub fn provider(&self) -> &dyn Provider {
        self.provider.as_ref()
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn tool_registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.agents.iter().position(|a| a.name == name)
    }

    fn available_names(&self) -> String {
        self.agents
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Make the named agent the active one, deactivating any previous agent
    /// first. Exactly one agent is active against the adapter afterwards.
    pub fn select(&mut self, name: &str) -> Result<(), Error> {
        let target = self.index_of(name).ok_or_else(|| TransferError::UnknownAgent {
            target: name.to_string(),
            available: self.available_names(),
        })?;

        let roster = self.roster();
        if let Some(current) = self.current {
            if current != target {
                self.agents[current].deactivate(self.provider.as_mut());
            }
        }
        self.agents[target].activate(self.provider.as_mut(), &self.registry, &roster);
        self.current = Some(target);
        Ok(())
    }

    /// Switch the current model, rebuilding the adapter when the provider
    /// changes. The active agent is deactivated on the old adapter and
    /// reactivated on the new one; histories are canonical, so they carry
    /// over untouched.
    pub fn switch_model(&mut self, model_id: &str) -> Result<(), Error> {
        let model = self.models.set_current(model_id)?;

        if model.provider == self.provider.name() {
            self.provider.set_model(&model);
            return Ok(());
        }

        let new_provider = factory::get_provider(&model.provider.clone(), &self.config, model)?;
        let roster = self.roster();
        if let Some(current) = self.current {
            self.agents[current].deactivate(self.provider.as_mut());
            self.provider = new_provider;
            self.agents[current].activate(self.provider.as_mut(), &self.registry, &roster);
        } else {
            self.provider = new_provider;
        }
        Ok(())
    }

    /// Hand the conversation to another agent.
    ///
    /// The target's history is replaced by: its rendered system prompt, the
    /// selected slice of the source's history (out-of-range indices dropped
    /// silently), and a synthetic user message carrying the task. The source
    /// history is untouched. Transfers chain; there is no return stack.
    pub fn transfer(&mut self, args: &TransferArgs) -> Result<(), Error> {
        let target = self
            .index_of(&args.target_agent)
            .ok_or_else(|| TransferError::UnknownAgent {
                target: args.target_agent.clone(),
                available: self.available_names(),
            })?;

        let slice: Vec<Message> = match self.current {
            Some(source) => {
                let history = &self.agents[source].history;
                args.relevant_messages
                    .iter()
                    .filter_map(|&index| history.get(index).cloned())
                    .collect()
            }
            None => Vec::new(),
        };

        let roster = self.roster();
        let rendered = self.agents[target].render_system_prompt(&roster);
        let mut history = Vec::with_capacity(slice.len() + 2);
        history.push(Message::system().with_text(rendered));
        history.extend(slice);
        history.push(Message::user().with_text(&args.task));
        self.agents[target].history = history;

        self.select(&args.target_agent)
    }

    pub fn set_thinking(&mut self, level: ThinkingLevel) -> bool {
        self.provider.set_thinking(level)
    }

    /// Snapshot of every agent history, for rollback and persistence.
    pub fn histories(&self) -> HashMap<String, Vec<Message>> {
        self.agents
            .iter()
            .filter(|a| !a.history.is_empty())
            .map(|a| (a.name.clone(), a.history.clone()))
            .collect()
    }

    pub fn restore_histories(&mut self, mut histories: HashMap<String, Vec<Message>>) {
        for agent in &mut self.agents {
            agent.history = histories.remove(&agent.name).unwrap_or_default();
        }
    }

    pub fn clear_histories(&mut self) {
        for agent in &mut self.agents {
            agent.history.clear();
        }
    }
}
