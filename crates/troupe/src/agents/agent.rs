use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::models::message::Message;
use crate::prompt_template::render_system_prompt;
use crate::providers::base::Provider;
use crate::tools::registry::ToolRegistry;

/// Name and description pair used for roster rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub name: String,
    pub description: String,
}

/// A named configuration (system prompt + tools + temperature) with its own
/// private message history. Created once from configuration and living for
/// the process lifetime; `active` flips as the manager selects agents.
pub struct Agent {
    pub name: String,
    pub description: String,
    pub system_prompt_template: String,
    pub tool_names: Vec<String>,
    pub temperature: Option<f32>,
    pub remote_endpoint: Option<String>,
    pub history: Vec<Message>,
    pub active: bool,
}

impl Agent {
    pub fn from_config(config: AgentConfig) -> Self {
        Self {
            name: config.name,
            description: config.description,
            system_prompt_template: config.system_prompt,
            tool_names: config.tools,
            temperature: config.temperature,
            remote_endpoint: config.remote_endpoint,
            history: Vec::new(),
            active: false,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote_endpoint.is_some()
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }

    pub fn render_system_prompt(&self, roster: &[AgentSummary]) -> String {
        render_system_prompt(
            &self.system_prompt_template,
            &self.name,
            &self.tool_names,
            roster,
        )
    }

    /// Install this agent on the adapter: rendered system prompt, a fresh
    /// tool set, and the agent's temperature.
    pub fn activate(
        &mut self,
        provider: &mut dyn Provider,
        registry: &ToolRegistry,
        roster: &[AgentSummary],
    ) {
        provider.set_system_prompt(&self.render_system_prompt(roster));
        provider.clear_tools();

        for tool_name in &self.tool_names {
            match registry.get_for(tool_name, &self.name) {
                Some(tool) => provider.register_tool(&tool),
                None => {
                    tracing::warn!(agent = %self.name, tool = %tool_name, "tool unavailable at activation");
                }
            }
        }

        provider.set_temperature(self.temperature);
        self.active = true;
    }

    pub fn deactivate(&mut self, provider: &mut dyn Provider) {
        provider.clear_tools();
        self.active = false;
    }
}
