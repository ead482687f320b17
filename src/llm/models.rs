//! Centralized model definitions
//!
//! Adding a model means adding one entry here; the registry instantiates
//! every entry whose provider has an API key.

use super::{AnthropicService, LlmError, LlmService, OpenAiCompatService};
use std::sync::Arc;

/// LLM provider enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Anthropic,
    Mistral,
    Perplexity,
    Groq,
}

impl Provider {
    pub fn display_name(self) -> &'static str {
        match self {
            Provider::Anthropic => "Anthropic",
            Provider::Mistral => "Mistral",
            Provider::Perplexity => "Perplexity",
            Provider::Groq => "Groq",
        }
    }

    /// Environment variable holding this provider's API key
    pub fn api_key_env_var(self) -> &'static str {
        match self {
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::Mistral => "MISTRAL_API_KEY",
            Provider::Perplexity => "PERPLEXITY_API_KEY",
            Provider::Groq => "GROQ_API_KEY",
        }
    }

    /// Chat-completions endpoint for OpenAI-compatible providers
    fn completions_url(self) -> Option<&'static str> {
        match self {
            Provider::Anthropic => None,
            Provider::Mistral => Some("https://api.mistral.ai/v1/chat/completions"),
            Provider::Perplexity => Some("https://api.perplexity.ai/chat/completions"),
            Provider::Groq => Some("https://api.groq.com/openai/v1/chat/completions"),
        }
    }
}

/// Model definition with metadata
#[derive(Debug, Clone)]
pub struct ModelDef {
    /// User-facing model ID (e.g., "mistral-small")
    pub id: &'static str,
    pub provider: Provider,
    /// API name used by the provider
    pub api_name: &'static str,
    pub description: &'static str,
}

impl ModelDef {
    /// Build the provider service for this model
    pub fn create(&self, api_key: String) -> Result<Arc<dyn LlmService>, LlmError> {
        if api_key.is_empty() {
            return Err(LlmError::not_configured(format!(
                "{} requires {}",
                self.id,
                self.provider.api_key_env_var()
            )));
        }
        let service: Arc<dyn LlmService> = match self.provider.completions_url() {
            None => Arc::new(AnthropicService::new(api_key, self.id, self.api_name)?),
            Some(url) => Arc::new(OpenAiCompatService::new(
                api_key,
                self.id,
                self.api_name,
                url,
            )?),
        };
        Ok(service)
    }
}

/// Get all available model definitions
pub fn all_models() -> &'static [ModelDef] {
    &[
        ModelDef {
            id: "claude-3-haiku",
            provider: Provider::Anthropic,
            api_name: "claude-3-haiku-20240307",
            description: "Claude 3 Haiku (fast, cheap)",
        },
        ModelDef {
            id: "claude-3.5-sonnet",
            provider: Provider::Anthropic,
            api_name: "claude-3-5-sonnet-20241022",
            description: "Claude 3.5 Sonnet (balanced)",
        },
        ModelDef {
            id: "mistral-small",
            provider: Provider::Mistral,
            api_name: "mistral-small-latest",
            description: "Mistral Small (query rewriting)",
        },
        ModelDef {
            id: "sonar",
            provider: Provider::Perplexity,
            api_name: "sonar",
            description: "Perplexity Sonar (online search answers)",
        },
        ModelDef {
            id: "llama3-70b",
            provider: Provider::Groq,
            api_name: "llama3-70b-8192",
            description: "Llama 3 70B on Groq",
        },
    ]
}
