//! Model registry for managing available LLM providers

use super::{
    all_models, GenerateOptions, LlmError, LlmRequest, LlmService, LoggingService, ModelDef,
    Provider, TextGenerator,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Configuration for LLM providers
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub anthropic_api_key: Option<String>,
    pub mistral_api_key: Option<String>,
    pub perplexity_api_key: Option<String>,
    pub groq_api_key: Option<String>,
    /// Default model ID
    pub default_model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            mistral_api_key: std::env::var("MISTRAL_API_KEY").ok(),
            perplexity_api_key: std::env::var("PERPLEXITY_API_KEY").ok(),
            groq_api_key: std::env::var("GROQ_API_KEY").ok(),
            default_model: std::env::var("DEFAULT_MODEL").ok(),
        }
    }

    fn api_key(&self, provider: Provider) -> Option<&String> {
        match provider {
            Provider::Anthropic => self.anthropic_api_key.as_ref(),
            Provider::Mistral => self.mistral_api_key.as_ref(),
            Provider::Perplexity => self.perplexity_api_key.as_ref(),
            Provider::Groq => self.groq_api_key.as_ref(),
        }
    }
}

/// Registry of available LLM models
pub struct ModelRegistry {
    services: HashMap<String, Arc<dyn LlmService>>,
    default_model: String,
}

impl ModelRegistry {
    pub fn new(config: &LlmConfig) -> Self {
        let mut services: HashMap<String, Arc<dyn LlmService>> = HashMap::new();

        for model_def in all_models() {
            if let Some(service) = Self::try_create_model(model_def, config) {
                services.insert(model_def.id.to_string(), service);
            }
        }

        let default_model = config
            .default_model
            .clone()
            .or_else(|| {
                if services.contains_key("claude-3-haiku") {
                    Some("claude-3-haiku".to_string())
                } else {
                    let mut ids: Vec<&String> = services.keys().collect();
                    ids.sort();
                    ids.first().map(|id| (*id).clone())
                }
            })
            .unwrap_or_else(|| "claude-3-haiku".to_string());

        Self {
            services,
            default_model,
        }
    }

    fn try_create_model(model_def: &ModelDef, config: &LlmConfig) -> Option<Arc<dyn LlmService>> {
        let api_key = config.api_key(model_def.provider)?.clone();

        match model_def.create(api_key) {
            Ok(service) => {
                tracing::debug!(
                    model = model_def.id,
                    provider = model_def.provider.display_name(),
                    description = model_def.description,
                    "Model available"
                );
                Some(Arc::new(LoggingService::new(service)))
            }
            Err(e) => {
                tracing::debug!(
                    model = model_def.id,
                    provider = model_def.provider.display_name(),
                    error = %e,
                    "Model unavailable"
                );
                None
            }
        }
    }

    /// Get a model by ID
    pub fn get(&self, model_id: &str) -> Option<Arc<dyn LlmService>> {
        self.services.get(model_id).cloned()
    }

    pub fn default_model_id(&self) -> &str {
        &self.default_model
    }

    /// List all available model IDs
    pub fn available_models(&self) -> Vec<String> {
        let mut models: Vec<_> = self.services.keys().cloned().collect();
        models.sort();
        models
    }

    pub fn has_models(&self) -> bool {
        !self.services.is_empty()
    }
}

#[async_trait]
impl TextGenerator for ModelRegistry {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String, LlmError> {
        let model_id = options.model.as_deref().unwrap_or(&self.default_model);
        let service = self.get(model_id).ok_or_else(|| {
            LlmError::not_configured(format!("Model not available: {model_id}"))
        })?;
        let response = service.complete(&LlmRequest::new(prompt, options)).await?;
        Ok(response.text)
    }
}
