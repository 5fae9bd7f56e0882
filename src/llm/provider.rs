//! Chat provider trait — common interface for all chat-completion backends.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

// ── Common Parameters ──────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct LlmParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub model: Option<String>,
}

impl LlmParams {
    /// Low-temperature, short-output parameters for internal structured
    /// calls (classification judge, extraction, merge).
    pub fn utility(max_tokens: u32) -> Self {
        Self {
            temperature: Some(0.2),
            max_tokens: Some(max_tokens),
            model: None,
        }
    }
}

pub type ChatChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Common interface for chat backends (OpenAI-compatible, Ollama, ...).
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Non-streaming completion for internal tool-use calls.
    async fn chat(&self, messages: Vec<ChatMessage>, params: Option<LlmParams>) -> Result<String>;

    /// Streaming completion — yields content deltas as they arrive.
    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        params: Option<LlmParams>,
    ) -> Result<ChatChunkStream>;

    /// Provider identifier (e.g. "openai", "ollama").
    fn id(&self) -> &str;
}
