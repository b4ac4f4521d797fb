//! Catalog of known models and the process-wide "current model" selection.

use std::collections::HashSet;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ToolUse,
    Vision,
    Thinking,
    Streaming,
}

/// A (provider, model-id) record with capabilities and pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub provider: String,
    pub display_name: String,
    pub capabilities: HashSet<Capability>,
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
    #[serde(default)]
    pub default: bool,
}

impl Model {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Cost in dollars for the given token counts.
    pub fn cost(&self, input_tokens: i64, output_tokens: i64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_price_per_million
            + (output_tokens as f64 / 1_000_000.0) * self.output_price_per_million
    }
}

fn model(
    id: &str,
    provider: &str,
    display_name: &str,
    capabilities: &[Capability],
    input_price: f64,
    output_price: f64,
    default: bool,
) -> Model {
    Model {
        id: id.to_string(),
        provider: provider.to_string(),
        display_name: display_name.to_string(),
        capabilities: capabilities.iter().copied().collect(),
        input_price_per_million: input_price,
        output_price_per_million: output_price,
        default,
    }
}

use Capability::{Streaming, Thinking, ToolUse, Vision};

fn default_models() -> Vec<Model> {
    vec![
        model(
            "claude-3-7-sonnet-latest",
            "anthropic",
            "Claude 3.7 Sonnet",
            &[ToolUse, Vision, Thinking, Streaming],
            3.0,
            15.0,
            true,
        ),
        model(
            "claude-3-5-haiku-latest",
            "anthropic",
            "Claude 3.5 Haiku",
            &[ToolUse, Vision, Streaming],
            0.8,
            4.0,
            false,
        ),
        model(
            "gpt-4o",
            "openai",
            "GPT-4o",
            &[ToolUse, Vision, Streaming],
            2.5,
            10.0,
            false,
        ),
        model(
            "o3-mini",
            "openai",
            "o3-mini",
            &[ToolUse, Thinking, Streaming],
            1.1,
            4.4,
            false,
        ),
        model(
            "gemini-2.0-flash",
            "gemini",
            "Gemini 2.0 Flash",
            &[ToolUse, Vision, Streaming],
            0.1,
            0.4,
            false,
        ),
        model(
            "llama-3.3-70b-versatile",
            "groq",
            "Llama 3.3 70B",
            &[ToolUse, Streaming],
            0.59,
            0.79,
            false,
        ),
        model(
            "meta-llama/Llama-3.3-70B-Instruct",
            "deepinfra",
            "Llama 3.3 70B (DeepInfra)",
            &[ToolUse, Streaming],
            0.23,
            0.4,
            false,
        ),
    ]
}

/// Registry of available models. Constructed once at startup and shared by
/// reference; `set_current` is atomic with respect to concurrent readers.
pub struct ModelRegistry {
    inner: RwLock<Inner>,
}

struct Inner {
    models: Vec<Model>,
    current: String,
}

impl ModelRegistry {
    /// Seed the registry with the built-in default set.
    pub fn new() -> Self {
        let models = default_models();
        let current = models
            .iter()
            .find(|m| m.default)
            .map(|m| m.id.clone())
            .unwrap_or_else(|| models[0].id.clone());
        ModelRegistry {
            inner: RwLock::new(Inner { models, current }),
        }
    }

    pub fn list(&self) -> Vec<Model> {
        self.inner.read().unwrap().models.clone()
    }

    pub fn list_by_provider(&self, provider: &str) -> Vec<Model> {
        self.inner
            .read()
            .unwrap()
            .models
            .iter()
            .filter(|m| m.provider == provider)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Model> {
        self.inner
            .read()
            .unwrap()
            .models
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    pub fn get_current(&self) -> Model {
        let inner = self.inner.read().unwrap();
        inner
            .models
            .iter()
            .find(|m| m.id == inner.current)
            .cloned()
            .expect("current model always names a registered model")
    }

    pub fn set_current(&self, id: &str) -> Result<Model, ConfigError> {
        let mut inner = self.inner.write().unwrap();
        match inner.models.iter().find(|m| m.id == id).cloned() {
            Some(found) => {
                inner.current = found.id.clone();
                Ok(found)
            }
            None => Err(ConfigError::UnknownProvider(format!("model '{id}'"))),
        }
    }

    /// Register a custom model. The provider must name a known adapter
    /// constructor or a configured openai-compatible endpoint.
    pub fn register(&self, model: Model, known_providers: &[String]) -> Result<(), ConfigError> {
        if !known_providers.iter().any(|p| p == &model.provider) {
            return Err(ConfigError::UnknownProvider(model.provider.clone()));
        }
        let mut inner = self.inner.write().unwrap();
        inner.models.retain(|m| m.id != model.id);
        inner.models.push(model);
        Ok(())
    }

    /// Pick the default (or first) model for a provider, if any is known.
    pub fn default_for_provider(&self, provider: &str) -> Option<Model> {
        let models = self.list_by_provider(provider);
        models
            .iter()
            .find(|m| m.default)
            .cloned()
            .or_else(|| models.first().cloned())
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
