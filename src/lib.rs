//! mnemos — a stateful conversational AI service.
//!
//! Every user turn flows through one pipeline: safety classification with
//! a session route lock, vector retrieval over long-term memories,
//! user-state enrichment (preferences, personality, emotion, goals),
//! prompt assembly, and a streamed model response, with memory extraction
//! running behind the turn.

pub mod ai;
pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod kv;
pub mod llm;
pub mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;

use crate::ai::audit::AuditLog;
use crate::ai::buffer::{ConversationBuffer, InProcessBuffer};
use crate::ai::consolidation::ConsolidationEngine;
use crate::ai::conversation::ConversationService;
use crate::ai::emotion::EmotionService;
use crate::ai::goals::GoalService;
use crate::ai::judge::SafetyClassifier;
use crate::ai::memory::MemoryStore;
use crate::ai::memory_extractor::MemoryExtractor;
use crate::ai::orchestrator::{Orchestrator, OrchestratorDeps};
use crate::ai::personality::PersonalityService;
use crate::ai::preferences::PreferenceService;
use crate::ai::session::SessionManager;
use crate::auth::AuthService;
use crate::config::Config;
use crate::embedding::{Embedder, LocalEmbedder, RemoteEmbedder};
use crate::llm::LlmService;
use crate::rate_limit::RateLimiter;

/// Shared application state handed to the HTTP adapter.
pub struct App {
    pub config: Config,
    pub db: SqlitePool,
    pub auth: Arc<AuthService>,
    pub orchestrator: Arc<Orchestrator>,
    pub conversations: ConversationService,
    pub buffer: Arc<dyn ConversationBuffer>,
    pub store: Arc<MemoryStore>,
    pub sessions: Arc<SessionManager>,
    pub preferences: Arc<PreferenceService>,
    pub personalities: Arc<PersonalityService>,
    pub goals: Arc<GoalService>,
    pub emotions: Arc<EmotionService>,
}

impl App {
    pub async fn build(config: Config) -> Result<Arc<App>> {
        let pool = db::connect(&config.database_url).await?;
        Self::build_with_pool(config, pool).await
    }

    /// Wire the full pipeline on an existing pool (tests use in-memory
    /// SQLite here).
    pub async fn build_with_pool(config: Config, pool: SqlitePool) -> Result<Arc<App>> {
        let embedder: Arc<dyn Embedder> = match config.embedding_provider.as_str() {
            "remote" => Arc::new(RemoteEmbedder::new(
                config.embedding_api_key.clone(),
                config.embedding_base_url.clone(),
                config.embedding_model.clone(),
                config.embedding_dim,
            )),
            _ => Arc::new(LocalEmbedder::new(config.embedding_dim)),
        };
        let llm = LlmService::from_config(&config);
        Self::assemble(config, pool, embedder, llm).await
    }

    pub async fn assemble(
        config: Config,
        pool: SqlitePool,
        embedder: Arc<dyn Embedder>,
        llm: LlmService,
    ) -> Result<Arc<App>> {
        let personalities = PersonalityService::new(pool.clone());
        personalities.seed_globals().await?;

        let auth = Arc::new(AuthService::new(
            pool.clone(),
            config.token_secret.clone(),
            config.allow_dev_user_header,
        ));

        let buffer: Arc<dyn ConversationBuffer> = Arc::new(InProcessBuffer::new(config.buffer_size));
        let store = Arc::new(MemoryStore::new(
            pool.clone(),
            config.embedding_dim,
            config.decay_half_life_days,
        ));
        let sessions = Arc::new(SessionManager::new(
            config.route_lock_turns,
            Duration::from_secs(config.session_idle_secs),
            None,
        ));
        let classifier = Arc::new(SafetyClassifier::new(
            Some(llm.utility()),
            config.judge_threshold,
            config.judge_cache_size,
        ));
        let consolidation = Arc::new(ConsolidationEngine::new(
            store.clone(),
            embedder.clone(),
            Some(llm.utility()),
            config.consolidation_min_similarity,
            config.consolidation_merge_similarity,
        ));
        let extractor = Arc::new(MemoryExtractor::new(
            store.clone(),
            embedder.clone(),
            llm.utility(),
            consolidation,
        ));

        let orchestrator = Orchestrator::new(OrchestratorDeps {
            config: config.clone(),
            conversations: ConversationService::new(pool.clone()),
            buffer: buffer.clone(),
            store: store.clone(),
            embedder,
            llm,
            classifier,
            audit: AuditLog::new(pool.clone()),
            sessions: sessions.clone(),
            preferences: PreferenceService::new(pool.clone()),
            personalities: PersonalityService::new(pool.clone()),
            emotions: EmotionService::new(pool.clone()),
            goals: GoalService::new(pool.clone()),
            extractor,
            rate_limiter: RateLimiter::new(config.rate_limit_burst, config.rate_limit_per_minute),
        });

        Ok(Arc::new(App {
            conversations: ConversationService::new(pool.clone()),
            preferences: Arc::new(PreferenceService::new(pool.clone())),
            personalities: Arc::new(personalities),
            goals: Arc::new(GoalService::new(pool.clone())),
            emotions: Arc::new(EmotionService::new(pool.clone())),
            db: pool,
            auth,
            orchestrator,
            buffer,
            store,
            sessions,
            config,
        }))
    }

    /// Periodic sweeps: idle session eviction and buffer cleanup.
    pub fn start_maintenance(self: &Arc<Self>) {
        let app = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(600));
            loop {
                interval.tick().await;
                let evicted = app.sessions.evict_idle().await;
                let cleaned = app
                    .buffer
                    .cleanup(Duration::from_secs(app.config.buffer_idle_secs))
                    .await
                    .unwrap_or(0);
                if evicted > 0 || cleaned > 0 {
                    tracing::debug!(evicted, cleaned, "maintenance sweep");
                }
            }
        });
    }
}
