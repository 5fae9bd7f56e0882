//! Service configuration loaded from the environment.
//!
//! Every tunable named in the pipeline (buffer size, retrieval K, judge
//! threshold, route-lock length, idle windows, decay half-life, similarity
//! floors, rate limit) has an env override and a documented default.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the HTTP adapter binds to.
    pub bind_addr: String,
    /// SQLite connection URL.
    pub database_url: String,
    /// HMAC secret for bearer tokens. Must be ≥32 bytes in production.
    pub token_secret: String,
    /// When false, the dev-only `x-user-id` header is rejected.
    pub allow_dev_user_header: bool,
    /// Comma-separated allowed CORS origins. "*" is rejected in production.
    pub allowed_origins: String,
    /// Disables the production startup checks (local development only).
    pub dev_mode: bool,

    /// Short-term buffer capacity per conversation (M).
    pub buffer_size: usize,
    /// Buffer entry TTL / idle cleanup window in seconds (T_idle).
    pub buffer_idle_secs: u64,
    /// Retrieved memories per turn (K).
    pub retrieval_k: usize,
    /// Minimum cosine similarity for retrieval.
    pub retrieval_min_similarity: f32,
    /// Embedding dimension (D).
    pub embedding_dim: usize,
    /// Memory decay half-life in days (T_half).
    pub decay_half_life_days: f64,
    /// Consolidation neighbor floor.
    pub consolidation_min_similarity: f32,
    /// Consolidation merge floor.
    pub consolidation_merge_similarity: f32,

    /// Confidence threshold below which the LLM judge runs (τ).
    pub judge_threshold: f32,
    /// Bounded LRU size for cached judge verdicts.
    pub judge_cache_size: usize,
    /// Route lock length in turns (N).
    pub route_lock_turns: u32,
    /// Session eviction window in seconds (T_session).
    pub session_idle_secs: u64,

    /// Token-bucket capacity per user.
    pub rate_limit_burst: u32,
    /// Token-bucket refill per minute.
    pub rate_limit_per_minute: u32,

    /// Deadline for classification + routing, milliseconds.
    pub classify_deadline_ms: u64,
    /// Deadline for the fan-out stage, milliseconds.
    pub fanout_deadline_ms: u64,
    /// Deadline until the first streamed chunk, milliseconds.
    pub first_chunk_deadline_ms: u64,

    /// Soft token cap for the assembled prompt.
    pub prompt_token_budget: usize,
    /// Base system persona prepended to every prompt.
    pub base_persona: String,

    /// Chat provider: "openai" or "ollama".
    pub llm_provider: String,
    pub llm_api_key: String,
    pub llm_base_url: String,
    pub llm_model: String,
    /// Cheap model used for judge/extraction/summary calls.
    pub llm_utility_model: String,

    /// Embedding provider: "local" (fastembed) or "remote".
    pub embedding_provider: String,
    pub embedding_api_key: String,
    pub embedding_base_url: String,
    pub embedding_model: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            database_url: "sqlite://mnemos.db".to_string(),
            token_secret: String::new(),
            allow_dev_user_header: false,
            allowed_origins: "http://localhost:3000".to_string(),
            dev_mode: false,

            buffer_size: 10,
            buffer_idle_secs: 3600,
            retrieval_k: 5,
            retrieval_min_similarity: 0.3,
            embedding_dim: 384,
            decay_half_life_days: 30.0,
            consolidation_min_similarity: 0.85,
            consolidation_merge_similarity: 0.92,

            judge_threshold: 0.7,
            judge_cache_size: 1024,
            route_lock_turns: 5,
            session_idle_secs: 24 * 3600,

            rate_limit_burst: 10,
            rate_limit_per_minute: 30,

            classify_deadline_ms: 2_000,
            fanout_deadline_ms: 5_000,
            first_chunk_deadline_ms: 15_000,

            prompt_token_budget: 6_000,
            base_persona: "You are a warm, attentive AI companion. You remember what the user \
                           tells you and you care about their goals and wellbeing."
                .to_string(),

            llm_provider: "openai".to_string(),
            llm_api_key: String::new(),
            llm_base_url: "https://api.openai.com/v1".to_string(),
            llm_model: "gpt-4o".to_string(),
            llm_utility_model: "gpt-4o-mini".to_string(),

            embedding_provider: "local".to_string(),
            embedding_api_key: String::new(),
            embedding_base_url: "https://api.openai.com/v1".to_string(),
            embedding_model: "all-MiniLM-L6-v2".to_string(),
        }
    }
}

impl Config {
    /// Build a config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_addr: env_str("MNEMOS_BIND_ADDR", d.bind_addr),
            database_url: env_str("DATABASE_URL", d.database_url),
            token_secret: env_str("MNEMOS_TOKEN_SECRET", d.token_secret),
            allow_dev_user_header: env_bool("MNEMOS_ALLOW_DEV_USER_HEADER", d.allow_dev_user_header),
            allowed_origins: env_str("MNEMOS_ALLOWED_ORIGINS", d.allowed_origins),
            dev_mode: env_bool("MNEMOS_DEV_MODE", d.dev_mode),

            buffer_size: env_parse("MNEMOS_BUFFER_SIZE", d.buffer_size),
            buffer_idle_secs: env_parse("MNEMOS_BUFFER_IDLE_SECS", d.buffer_idle_secs),
            retrieval_k: env_parse("MNEMOS_RETRIEVAL_K", d.retrieval_k),
            retrieval_min_similarity: env_parse("MNEMOS_RETRIEVAL_MIN_SIM", d.retrieval_min_similarity),
            embedding_dim: env_parse("MNEMOS_EMBEDDING_DIM", d.embedding_dim),
            decay_half_life_days: env_parse("MNEMOS_DECAY_HALF_LIFE_DAYS", d.decay_half_life_days),
            consolidation_min_similarity: env_parse(
                "MNEMOS_CONSOLIDATION_MIN_SIM",
                d.consolidation_min_similarity,
            ),
            consolidation_merge_similarity: env_parse(
                "MNEMOS_CONSOLIDATION_MERGE_SIM",
                d.consolidation_merge_similarity,
            ),

            judge_threshold: env_parse("MNEMOS_JUDGE_THRESHOLD", d.judge_threshold),
            judge_cache_size: env_parse("MNEMOS_JUDGE_CACHE_SIZE", d.judge_cache_size),
            route_lock_turns: env_parse("MNEMOS_ROUTE_LOCK_TURNS", d.route_lock_turns),
            session_idle_secs: env_parse("MNEMOS_SESSION_IDLE_SECS", d.session_idle_secs),

            rate_limit_burst: env_parse("MNEMOS_RATE_LIMIT_BURST", d.rate_limit_burst),
            rate_limit_per_minute: env_parse("MNEMOS_RATE_LIMIT_PER_MINUTE", d.rate_limit_per_minute),

            classify_deadline_ms: env_parse("MNEMOS_CLASSIFY_DEADLINE_MS", d.classify_deadline_ms),
            fanout_deadline_ms: env_parse("MNEMOS_FANOUT_DEADLINE_MS", d.fanout_deadline_ms),
            first_chunk_deadline_ms: env_parse(
                "MNEMOS_FIRST_CHUNK_DEADLINE_MS",
                d.first_chunk_deadline_ms,
            ),

            prompt_token_budget: env_parse("MNEMOS_PROMPT_TOKEN_BUDGET", d.prompt_token_budget),
            base_persona: env_str("MNEMOS_BASE_PERSONA", d.base_persona),

            llm_provider: env_str("MNEMOS_LLM_PROVIDER", d.llm_provider),
            llm_api_key: env_str("MNEMOS_LLM_API_KEY", d.llm_api_key),
            llm_base_url: env_str("MNEMOS_LLM_BASE_URL", d.llm_base_url),
            llm_model: env_str("MNEMOS_LLM_MODEL", d.llm_model),
            llm_utility_model: env_str("MNEMOS_LLM_UTILITY_MODEL", d.llm_utility_model),

            embedding_provider: env_str("MNEMOS_EMBEDDING_PROVIDER", d.embedding_provider),
            embedding_api_key: env_str("MNEMOS_EMBEDDING_API_KEY", d.embedding_api_key),
            embedding_base_url: env_str("MNEMOS_EMBEDDING_BASE_URL", d.embedding_base_url),
            embedding_model: env_str("MNEMOS_EMBEDDING_MODEL", d.embedding_model),
        }
    }

    /// Mandatory production checks. Returns the list of violations; startup
    /// refuses to proceed on a non-empty list unless `dev_mode` is set.
    pub fn production_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if self.token_secret.len() < 32 {
            violations.push("MNEMOS_TOKEN_SECRET must be at least 32 bytes".to_string());
        }
        if self.allow_dev_user_header {
            violations.push("MNEMOS_ALLOW_DEV_USER_HEADER must be disabled".to_string());
        }
        if self.allowed_origins.split(',').any(|o| o.trim() == "*") {
            violations.push("MNEMOS_ALLOWED_ORIGINS must not contain a wildcard".to_string());
        }
        violations
    }
}

fn env_str(key: &str, default: String) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.buffer_size, 10);
        assert_eq!(c.retrieval_k, 5);
        assert_eq!(c.route_lock_turns, 5);
        assert!((c.judge_threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(c.session_idle_secs, 86_400);
        assert!((c.decay_half_life_days - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn production_checks_flag_short_secret_and_wildcard_origin() {
        let mut c = Config::default();
        c.token_secret = "short".to_string();
        c.allowed_origins = "*".to_string();
        let violations = c.production_violations();
        assert_eq!(violations.len(), 2);

        c.token_secret = "x".repeat(32);
        c.allowed_origins = "https://app.example.com".to_string();
        assert!(c.production_violations().is_empty());
    }
}
