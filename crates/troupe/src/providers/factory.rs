use strum_macros::EnumIter;

use super::anthropic::AnthropicProvider;
use super::base::Provider;
use super::gemini::GeminiProvider;
use super::openai::OpenAiProvider;
use crate::config::GlobalConfig;
use crate::errors::{ConfigError, Error};
use crate::registry::Model;

#[derive(EnumIter, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    Anthropic,
    OpenAi,
    Gemini,
    Groq,
    DeepInfra,
}

impl ProviderType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "anthropic" => Some(ProviderType::Anthropic),
            "openai" => Some(ProviderType::OpenAi),
            "gemini" => Some(ProviderType::Gemini),
            "groq" => Some(ProviderType::Groq),
            "deepinfra" => Some(ProviderType::DeepInfra),
            _ => None,
        }
    }
}

/// Every provider name an adapter can be constructed for: the built-in set
/// plus configured openai-compatible endpoints.
pub fn known_providers(config: &GlobalConfig) -> Vec<String> {
    let mut names: Vec<String> = ["anthropic", "openai", "gemini", "groq", "deepinfra"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    names.extend(config.custom_llm_providers.iter().map(|p| p.name.clone()));
    names
}

/// Build the adapter for a provider name, resolving credentials from the
/// global config (config keys supersede environment variables).
pub fn get_provider(
    provider_name: &str,
    config: &GlobalConfig,
    model: Model,
) -> Result<Box<dyn Provider>, Error> {
    if let Some(provider_type) = ProviderType::from_name(provider_name) {
        let api_key = config
            .api_key(provider_name)
            .ok_or_else(|| ConfigError::MissingCredentials(provider_name.to_string()))?;

        let provider: Box<dyn Provider> = match provider_type {
            ProviderType::Anthropic => Box::new(AnthropicProvider::new(
                "https://api.anthropic.com".to_string(),
                api_key,
                model,
            )?),
            ProviderType::OpenAi => Box::new(OpenAiProvider::new(
                "https://api.openai.com".to_string(),
                api_key,
                model,
            )?),
            ProviderType::Gemini => Box::new(GeminiProvider::new(
                "https://generativelanguage.googleapis.com".to_string(),
                api_key,
                model,
            )?),
            ProviderType::Groq => Box::new(OpenAiProvider::compatible(
                "groq",
                "https://api.groq.com/openai".to_string(),
                "/v1/chat/completions",
                api_key,
                model,
            )?),
            ProviderType::DeepInfra => Box::new(OpenAiProvider::compatible(
                "deepinfra",
                "https://api.deepinfra.com".to_string(),
                "/v1/openai/chat/completions",
                api_key,
                model,
            )?),
        };
        return Ok(provider);
    }

    // Fall back to a configured openai-compatible endpoint
    let custom = config
        .custom_provider(provider_name)
        .ok_or_else(|| ConfigError::UnknownProvider(provider_name.to_string()))?;
    let api_key = custom.api_key.clone().unwrap_or_default();
    Ok(Box::new(OpenAiProvider::compatible(
        &custom.name,
        custom.api_base_url.clone(),
        "/chat/completions",
        api_key,
        model,
    )?))
}
