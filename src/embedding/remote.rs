//! Remote embedding via an OpenAI-style `/embeddings` endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::embedding::{normalize, Embedder};
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

pub struct RemoteEmbedder {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    dim: usize,
}

impl RemoteEmbedder {
    pub fn new(api_key: String, base_url: String, model: String, dim: usize) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url,
            model,
            dim,
        }
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        batch
            .pop()
            .ok_or_else(|| Error::UpstreamUnavailable("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&EmbeddingRequest { model: &self.model, input: texts })
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("embedding request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamUnavailable(format!(
                "embedding API error ({status}): {error_text}"
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("embedding parse failed: {e}")))?;

        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        let mut embeddings: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();

        for v in embeddings.iter_mut() {
            if v.len() != self.dim {
                return Err(Error::UpstreamUnavailable(format!(
                    "embedding dimension mismatch: got {}, expected {}",
                    v.len(),
                    self.dim
                )));
            }
            normalize(v);
        }
        Ok(embeddings)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn embeds_and_normalizes_remote_vectors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": [3.0, 4.0]}]
            })))
            .mount(&server)
            .await;

        let embedder = RemoteEmbedder::new(
            "test-key".to_string(),
            server.uri(),
            "test-model".to_string(),
            2,
        );
        let v = embedder.embed("hello").await.unwrap();
        assert_eq!(v.len(), 2);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": [1.0, 2.0, 3.0]}]
            })))
            .mount(&server)
            .await;

        let embedder =
            RemoteEmbedder::new(String::new(), server.uri(), "m".to_string(), 2);
        assert!(embedder.embed("hello").await.is_err());
    }

    #[tokio::test]
    async fn transport_failure_is_upstream_unavailable() {
        let embedder = RemoteEmbedder::new(
            String::new(),
            "http://127.0.0.1:1".to_string(),
            "m".to_string(),
            2,
        );
        match embedder.embed("hello").await {
            Err(crate::error::Error::UpstreamUnavailable(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
