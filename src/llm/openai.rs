//! OpenAI-compatible provider — SSE streaming via `/chat/completions`.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::llm::provider::{ChatChunkStream, ChatMessage, ChatProvider, LlmParams};

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    provider_id: String,
}

impl OpenAIProvider {
    pub fn new(api_key: String, base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: model.unwrap_or_else(|| "gpt-4o".to_string()),
            provider_id: "openai".to_string(),
        }
    }

    pub fn with_id(mut self, id: String) -> Self {
        self.provider_id = id;
        self
    }

    fn build_request(
        &self,
        messages: Vec<ChatMessage>,
        params: Option<LlmParams>,
        stream: bool,
    ) -> ChatCompletionRequest {
        let params = params.unwrap_or_default();
        ChatCompletionRequest {
            model: params.model.unwrap_or_else(|| self.model.clone()),
            messages,
            stream,
            temperature: params.temperature.unwrap_or(0.7),
            max_tokens: params.max_tokens,
        }
    }

    async fn send(&self, body: &ChatCompletionRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("chat request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamUnavailable(format!(
                "chat API error ({status}): {error_text}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatProvider for OpenAIProvider {
    async fn chat(&self, messages: Vec<ChatMessage>, params: Option<LlmParams>) -> Result<String> {
        let body = self.build_request(messages, params, false);
        let response = self.send(&body).await?;

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("chat response parse failed: {e}")))?;

        Ok(parsed["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string())
    }

    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        params: Option<LlmParams>,
    ) -> Result<ChatChunkStream> {
        let body = self.build_request(messages, params, true);
        let response = self.send(&body).await?;

        let stream = response
            .bytes_stream()
            .eventsource()
            .map(|result| match result {
                Ok(event) => {
                    if event.data == "[DONE]" {
                        return Ok(None);
                    }
                    match serde_json::from_str::<StreamResponse>(&event.data) {
                        Ok(parsed) => Ok(parsed
                            .choices
                            .first()
                            .and_then(|c| c.delta.content.clone())),
                        // Keep-alives and non-delta frames are skipped
                        Err(_) => Ok(None),
                    }
                }
                Err(e) => Err(Error::UpstreamUnavailable(format!("stream error: {e}"))),
            })
            .filter_map(|res| async {
                match res {
                    Ok(Some(content)) => Some(Ok(content)),
                    Ok(None) => None,
                    Err(e) => Some(Err(e)),
                }
            });

        Ok(Box::pin(stream))
    }

    fn id(&self) -> &str {
        &self.provider_id
    }
}
