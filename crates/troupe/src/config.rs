//! Configuration files consumed at startup: the global JSON config (API keys
//! and custom providers), the agent roster TOML, and the MCP servers manifest.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::registry::{Capability, Model};

/// Environment variable for each built-in provider's credential. Keys found
/// in the global config supersede these.
pub const PROVIDER_ENV_KEYS: &[(&str, &str)] = &[
    ("anthropic", "ANTHROPIC_API_KEY"),
    ("openai", "OPENAI_API_KEY"),
    ("gemini", "GEMINI_API_KEY"),
    ("groq", "GROQ_API_KEY"),
    ("deepinfra", "DEEPINFRA_API_KEY"),
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    #[serde(default)]
    pub custom_llm_providers: Vec<CustomProvider>,
}

/// An openai-compatible endpoint declared in the global config, together with
/// the models it serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomProvider {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub api_base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub default_model_id: String,
    #[serde(default = "default_true")]
    pub is_stream: bool,
    #[serde(default)]
    pub available_models: Vec<CustomModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomModel {
    pub id: String,
    pub provider: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub input_token_price_1m: f64,
    #[serde(default)]
    pub output_token_price_1m: f64,
}

fn default_true() -> bool {
    true
}

impl GlobalConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Malformed {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Resolve the credential for a provider: config key first, then the
    /// provider's environment variable.
    pub fn api_key(&self, provider: &str) -> Option<String> {
        let env_key = PROVIDER_ENV_KEYS
            .iter()
            .find(|(name, _)| *name == provider)
            .map(|(_, key)| *key);

        if let Some(key) = env_key {
            if let Some(value) = self.api_keys.get(key) {
                return Some(value.clone());
            }
            if let Ok(value) = std::env::var(key) {
                if !value.is_empty() {
                    return Some(value);
                }
            }
            return None;
        }

        // Custom providers carry their key inline.
        self.custom_llm_providers
            .iter()
            .find(|p| p.name == provider)
            .and_then(|p| p.api_key.clone())
    }

    pub fn custom_provider(&self, name: &str) -> Option<&CustomProvider> {
        self.custom_llm_providers.iter().find(|p| p.name == name)
    }

    /// Models contributed by custom providers, converted to registry records.
    pub fn custom_models(&self) -> Vec<Model> {
        self.custom_llm_providers
            .iter()
            .flat_map(|provider| {
                provider.available_models.iter().map(|m| Model {
                    id: m.id.clone(),
                    provider: provider.name.clone(),
                    display_name: m.name.clone(),
                    capabilities: m
                        .capabilities
                        .iter()
                        .filter_map(|c| match c.as_str() {
                            "tool_use" => Some(Capability::ToolUse),
                            "vision" => Some(Capability::Vision),
                            "thinking" => Some(Capability::Thinking),
                            "streaming" => Some(Capability::Streaming),
                            _ => None,
                        })
                        .collect(),
                    input_price_per_million: m.input_token_price_1m,
                    output_price_per_million: m.output_token_price_1m,
                    default: m.id == provider.default_model_id,
                })
            })
            .collect()
    }
}

/// One `[[agents]]` record from the agent configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tools: Vec<String>,
    pub system_prompt: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub remote_endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsFile {
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

impl AgentsFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file: AgentsFile = toml::from_str(&raw).map_err(|e| ConfigError::Malformed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let mut seen = std::collections::HashSet::new();
        for agent in &file.agents {
            if !seen.insert(agent.name.clone()) {
                return Err(ConfigError::DuplicateAgent(agent.name.clone()));
            }
        }
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_agents_file_parsing() {
        let toml_src = r#"
[[agents]]
name = "Router"
description = "Routes requests to specialists"
tools = ["transfer"]
system_prompt = "Today is {current_date}. Route the user."

[[agents]]
name = "Coder"
description = "Writes code"
tools = []
system_prompt = "You write code."
temperature = 0.2
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_src.as_bytes()).unwrap();
        let parsed = AgentsFile::load(file.path()).unwrap();
        assert_eq!(parsed.agents.len(), 2);
        assert_eq!(parsed.agents[0].name, "Router");
        assert_eq!(parsed.agents[1].temperature, Some(0.2));
    }

    #[test]
    fn test_agents_file_rejects_duplicates() {
        let toml_src = r#"
[[agents]]
name = "A"
description = "first"
system_prompt = "p"

[[agents]]
name = "A"
description = "second"
system_prompt = "p"
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_src.as_bytes()).unwrap();
        assert!(matches!(
            AgentsFile::load(file.path()),
            Err(ConfigError::DuplicateAgent(_))
        ));
    }

    #[test]
    fn test_global_config_key_precedence() {
        let config: GlobalConfig = serde_json::from_value(serde_json::json!({
            "api_keys": { "ANTHROPIC_API_KEY": "from-config" }
        }))
        .unwrap();
        assert_eq!(config.api_key("anthropic").as_deref(), Some("from-config"));
    }

    #[test]
    fn test_custom_models_conversion() {
        let config: GlobalConfig = serde_json::from_value(serde_json::json!({
            "custom_llm_providers": [{
                "name": "local-vllm",
                "type": "openai_compatible",
                "api_base_url": "http://localhost:8000/v1",
                "default_model_id": "qwen-32b",
                "is_stream": true,
                "available_models": [{
                    "id": "qwen-32b",
                    "provider": "local-vllm",
                    "name": "Qwen 32B",
                    "capabilities": ["tool_use", "streaming"],
                    "input_token_price_1m": 0.0,
                    "output_token_price_1m": 0.0
                }]
            }]
        }))
        .unwrap();

        let models = config.custom_models();
        assert_eq!(models.len(), 1);
        assert!(models[0].default);
        assert!(models[0].supports(Capability::ToolUse));
        assert_eq!(models[0].provider, "local-vllm");
    }
}
