//! Local embedding via fastembed (all-MiniLM-L6-v2, 384 dims).
//!
//! The model is lazy-loaded on first use: local files first so air-gapped
//! deployments work, then a hub download into `models/`.

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::embedding::{normalize, Embedder};
use crate::error::{Error, Result};

const LOCAL_MODEL_DIR: &str = "models";

pub struct LocalEmbedder {
    model: tokio::sync::OnceCell<Mutex<TextEmbedding>>,
    dim: usize,
}

impl LocalEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            model: tokio::sync::OnceCell::new(),
            dim,
        }
    }

    /// Try to load the embedding model from local snapshot files (no network).
    fn try_load_local() -> Option<TextEmbedding> {
        use fastembed::{InitOptionsUserDefined, TokenizerFiles, UserDefinedEmbeddingModel};
        use std::fs;

        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd);
        }
        if let Ok(exe) = std::env::current_exe() {
            if let Some(exe_dir) = exe.parent() {
                candidates.push(exe_dir.to_path_buf());
            }
        }

        for base in &candidates {
            let dir = base.join(LOCAL_MODEL_DIR);
            let Ok(entries) = fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let snapshot = entry.path();
                let onnx = snapshot.join("model.onnx");
                let tokenizer = snapshot.join("tokenizer.json");
                let config = snapshot.join("config.json");
                if !onnx.exists() || !tokenizer.exists() || !config.exists() {
                    continue;
                }

                let model_def = UserDefinedEmbeddingModel::new(
                    fs::read(&onnx).ok()?,
                    TokenizerFiles {
                        tokenizer_file: fs::read(&tokenizer).ok()?,
                        config_file: fs::read(&config).ok()?,
                        special_tokens_map_file: fs::read(snapshot.join("special_tokens_map.json"))
                            .unwrap_or_default(),
                        tokenizer_config_file: fs::read(snapshot.join("tokenizer_config.json"))
                            .unwrap_or_default(),
                    },
                );

                match TextEmbedding::try_new_from_user_defined(
                    model_def,
                    InitOptionsUserDefined::default(),
                ) {
                    Ok(model) => {
                        tracing::info!("embedding model loaded from {}", snapshot.display());
                        return Some(model);
                    }
                    Err(e) => {
                        tracing::warn!("failed to load local embedding model: {e}");
                    }
                }
            }
        }
        None
    }

    async fn get_model(&self) -> Result<&Mutex<TextEmbedding>> {
        self.model
            .get_or_try_init(|| async {
                if let Some(model) = Self::try_load_local() {
                    return Ok(Mutex::new(model));
                }

                tracing::info!("no local embedding model found, downloading");
                let model = TextEmbedding::try_new(
                    InitOptions::new(EmbeddingModel::AllMiniLML6V2)
                        .with_cache_dir(PathBuf::from(LOCAL_MODEL_DIR)),
                )
                .map_err(|e| Error::UpstreamUnavailable(format!("embedding model init: {e}")))?;
                Ok(Mutex::new(model))
            })
            .await
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        batch
            .pop()
            .ok_or_else(|| Error::Internal("empty embedding batch".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.get_model().await?;
        let mut guard = model.lock().await;
        let mut embeddings = guard
            .embed(texts.to_vec(), None)
            .map_err(|e| Error::UpstreamUnavailable(format!("embedding failed: {e}")))?;
        for v in embeddings.iter_mut() {
            normalize(v);
        }
        Ok(embeddings)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}
