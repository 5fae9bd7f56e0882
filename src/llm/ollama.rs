//! Ollama provider — native streaming via `/api/chat`.
//!
//! Ollama streams newline-delimited JSON objects:
//! ```json
//! {"model":"llama3","message":{"role":"assistant","content":"Hi"},"done":false}
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::llm::provider::{ChatChunkStream, ChatMessage, ChatProvider, LlmParams};

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaStreamChunk {
    message: Option<OllamaMessageResponse>,
    done: bool,
}

/// Reassembles NDJSON lines from raw network chunks. A JSON object split
/// across two chunks stays in the buffer until its closing newline
/// arrives; only complete lines are parsed.
#[derive(Default)]
struct NdjsonFramer {
    buffer: String,
    done: bool,
}

impl NdjsonFramer {
    /// Feed one network chunk; returns the content deltas from every
    /// complete line now available.
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut contents = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() || self.done {
                continue;
            }
            // Unparsable complete lines are keep-alives; skip them
            if let Ok(chunk) = serde_json::from_str::<OllamaStreamChunk>(line) {
                if chunk.done {
                    self.done = true;
                    continue;
                }
                if let Some(content) = chunk.message.and_then(|m| m.content) {
                    if !content.is_empty() {
                        contents.push(content);
                    }
                }
            }
        }
        contents
    }
}

#[derive(Debug, Deserialize)]
struct OllamaMessageResponse {
    content: Option<String>,
}

pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(base_url: Option<String>, model: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.unwrap_or_else(|| "http://localhost:11434".to_string()),
            model,
        }
    }

    fn build_request(
        &self,
        messages: Vec<ChatMessage>,
        params: Option<LlmParams>,
        stream: bool,
    ) -> OllamaChatRequest {
        let params = params.unwrap_or_default();
        let options = if params.temperature.is_some() || params.max_tokens.is_some() {
            Some(OllamaOptions {
                temperature: params.temperature,
                num_predict: params.max_tokens,
            })
        } else {
            None
        };
        OllamaChatRequest {
            model: params.model.unwrap_or_else(|| self.model.clone()),
            messages,
            stream,
            options,
        }
    }

    async fn send(&self, body: &OllamaChatRequest) -> Result<reqwest::Response> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("ollama request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamUnavailable(format!(
                "ollama API error: {error_text}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    async fn chat(&self, messages: Vec<ChatMessage>, params: Option<LlmParams>) -> Result<String> {
        let body = self.build_request(messages, params, false);
        let response = self.send(&body).await?;

        let chunk: OllamaStreamChunk = response
            .json()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("ollama response parse failed: {e}")))?;

        Ok(chunk.message.and_then(|m| m.content).unwrap_or_default())
    }

    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        params: Option<LlmParams>,
    ) -> Result<ChatChunkStream> {
        let body = self.build_request(messages, params, true);
        let response = self.send(&body).await?;

        // Ollama streams newline-delimited JSON; a line may span several
        // network chunks, so framing state is carried across polls
        let stream = response
            .bytes_stream()
            .scan(NdjsonFramer::default(), |framer, chunk_result| {
                let item = match chunk_result {
                    Ok(bytes) => Ok(framer.push(&bytes)),
                    Err(e) => Err(Error::UpstreamUnavailable(format!("stream error: {e}"))),
                };
                futures::future::ready(Some(item))
            })
            .filter_map(|res| async {
                match res {
                    Ok(contents) if contents.is_empty() => None,
                    Ok(contents) => Some(Ok(contents.join(""))),
                    Err(e) => Some(Err(e)),
                }
            });

        Ok(Box::pin(stream))
    }

    fn id(&self) -> &str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(content: &str, done: bool) -> String {
        format!(
            "{{\"message\":{{\"role\":\"assistant\",\"content\":\"{content}\"}},\"done\":{done}}}\n"
        )
    }

    #[test]
    fn complete_lines_in_one_chunk_all_yield_content() {
        let mut framer = NdjsonFramer::default();
        let chunk = format!("{}{}", line("Hel", false), line("lo", false));
        assert_eq!(framer.push(chunk.as_bytes()), vec!["Hel", "lo"]);
    }

    #[test]
    fn a_line_split_across_chunks_is_reassembled() {
        let mut framer = NdjsonFramer::default();
        let full = line("Hello there", false);
        let (head, tail) = full.split_at(20);

        // The fragment has no newline yet: nothing is emitted, nothing lost
        assert!(framer.push(head.as_bytes()).is_empty());
        assert_eq!(framer.push(tail.as_bytes()), vec!["Hello there"]);
    }

    #[test]
    fn split_point_inside_a_utf8_safe_boundary_of_two_lines() {
        let mut framer = NdjsonFramer::default();
        let both = format!("{}{}", line("one", false), line("two", false));
        // First chunk ends midway through the second object
        let cut = line("one", false).len() + 10;
        let (head, tail) = both.split_at(cut);

        assert_eq!(framer.push(head.as_bytes()), vec!["one"]);
        assert_eq!(framer.push(tail.as_bytes()), vec!["two"]);
    }

    #[test]
    fn done_marker_stops_emission() {
        let mut framer = NdjsonFramer::default();
        let chunk = format!("{}{}{}", line("a", false), line("", true), line("late", false));
        assert_eq!(framer.push(chunk.as_bytes()), vec!["a"]);
        assert!(framer.push(line("more", false).as_bytes()).is_empty());
    }

    #[test]
    fn keep_alive_and_blank_lines_are_skipped() {
        let mut framer = NdjsonFramer::default();
        let chunk = format!("\n\nnot json\n{}", line("ok", false));
        assert_eq!(framer.push(chunk.as_bytes()), vec!["ok"]);
    }
}
