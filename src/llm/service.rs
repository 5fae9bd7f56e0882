//! LLM service — holds the active chat provider plus the cheap utility
//! provider used for internal structured calls (judge, extraction, merge).

use std::sync::Arc;

use crate::config::Config;
use crate::llm::ollama::OllamaProvider;
use crate::llm::openai::OpenAIProvider;
use crate::llm::provider::ChatProvider;

#[derive(Clone)]
pub struct LlmService {
    chat: Arc<dyn ChatProvider>,
    utility: Arc<dyn ChatProvider>,
}

impl LlmService {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chat: build_provider(config, &config.llm_model),
            utility: build_provider(config, &config.llm_utility_model),
        }
    }

    /// Construct from explicit providers (tests, embedded deployments).
    pub fn from_providers(chat: Arc<dyn ChatProvider>, utility: Arc<dyn ChatProvider>) -> Self {
        Self { chat, utility }
    }

    /// The provider that streams user-visible responses.
    pub fn chat(&self) -> Arc<dyn ChatProvider> {
        self.chat.clone()
    }

    /// The provider for internal structured calls.
    pub fn utility(&self) -> Arc<dyn ChatProvider> {
        self.utility.clone()
    }
}

/// Factory: build a provider for the given model from config.
fn build_provider(config: &Config, model: &str) -> Arc<dyn ChatProvider> {
    match config.llm_provider.as_str() {
        "ollama" => Arc::new(OllamaProvider::new(
            Some(config.llm_base_url.clone()),
            model.to_string(),
        )),
        _ => Arc::new(OpenAIProvider::new(
            config.llm_api_key.clone(),
            Some(config.llm_base_url.clone()),
            Some(model.to_string()),
        )),
    }
}
