//! The per-turn chat pipeline.
//!
//! Turns on the same conversation are strictly serialized: the next turn
//! cannot persist until the prior one has emitted its terminal event.
//! Within a turn, the fan-out stage runs its subtasks concurrently under
//! one deadline, each degrading to a default on timeout. The LLM stream
//! is relayed chunk-by-chunk; memory extraction runs afterwards in the
//! background and never affects the delivered response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::ai::audit::AuditLog;
use crate::ai::buffer::{BufferedMessage, ConversationBuffer};
use crate::ai::classifier::{normalize, Classification, LayerOutcome, SafetyLabel};
use crate::ai::conversation::{Conversation, ConversationService};
use crate::ai::emotion::{detect_hybrid, EmotionReading, EmotionService, SentimentTrend};
use crate::ai::events::ChatEvent;
use crate::ai::goals::{GoalService, GoalStatus, GoalTrackingOutcome};
use crate::ai::judge::SafetyClassifier;
use crate::ai::memory::{Memory, MemoryStore, SearchFilters};
use crate::ai::memory_extractor::MemoryExtractor;
use crate::ai::personality::{detect_archetype_change, PersonalityProfile, PersonalityService};
use crate::ai::preferences::{Preferences, PreferenceService};
use crate::ai::prompts::{assemble, PromptInputs};
use crate::ai::session::{route_for, Route, SessionManager};
use crate::auth::AuthedUser;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::llm::{retry_transient, LlmParams, LlmService};
use crate::rate_limit::RateLimiter;

const MESSAGE_MAX_CHARS: usize = 8_000;

const REFUSAL_MESSAGE: &str = "I can't continue with that. I'm happy to keep talking about \
                               something else — what's on your mind?";

pub struct ChatTurnRequest {
    pub user: AuthedUser,
    pub conversation_id: Option<Uuid>,
    pub message: String,
    pub personality_name: Option<String>,
}

pub struct OrchestratorDeps {
    pub config: Config,
    pub conversations: ConversationService,
    pub buffer: Arc<dyn ConversationBuffer>,
    pub store: Arc<MemoryStore>,
    pub embedder: Arc<dyn Embedder>,
    pub llm: LlmService,
    pub classifier: Arc<SafetyClassifier>,
    pub audit: AuditLog,
    pub sessions: Arc<SessionManager>,
    pub preferences: PreferenceService,
    pub personalities: PersonalityService,
    pub emotions: EmotionService,
    pub goals: GoalService,
    pub extractor: Arc<MemoryExtractor>,
    pub rate_limiter: RateLimiter,
}

pub struct Orchestrator {
    config: Config,
    conversations: ConversationService,
    buffer: Arc<dyn ConversationBuffer>,
    store: Arc<MemoryStore>,
    embedder: Arc<dyn Embedder>,
    llm: LlmService,
    classifier: Arc<SafetyClassifier>,
    audit: AuditLog,
    sessions: Arc<SessionManager>,
    preferences: PreferenceService,
    personalities: PersonalityService,
    emotions: EmotionService,
    goals: GoalService,
    extractor: Arc<MemoryExtractor>,
    rate_limiter: RateLimiter,
    turn_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

/// Everything the fan-out stage resolved for this turn.
#[derive(Default)]
struct FanoutOutcome {
    preferences: Preferences,
    personality: Option<PersonalityProfile>,
    emotion: Option<EmotionReading>,
    emotion_trend: Option<SentimentTrend>,
    goal_outcome: GoalTrackingOutcome,
    active_goals: Vec<crate::ai::goals::Goal>,
    memories: Vec<(Memory, f32)>,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Arc<Self> {
        Arc::new(Self {
            config: deps.config,
            conversations: deps.conversations,
            buffer: deps.buffer,
            store: deps.store,
            embedder: deps.embedder,
            llm: deps.llm,
            classifier: deps.classifier,
            audit: deps.audit,
            sessions: deps.sessions,
            preferences: deps.preferences,
            personalities: deps.personalities,
            emotions: deps.emotions,
            goals: deps.goals,
            extractor: deps.extractor,
            rate_limiter: deps.rate_limiter,
            turn_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Start a turn. Pre-stream failures (validation, rate limit,
    /// ownership) return an error and no stream is opened; otherwise the
    /// returned receiver yields the event stream, ending with exactly one
    /// terminal event.
    pub async fn chat(
        self: &Arc<Self>,
        request: ChatTurnRequest,
    ) -> Result<mpsc::Receiver<ChatEvent>> {
        let message = request.message.trim().to_string();
        if message.is_empty() {
            return Err(Error::Validation("message must not be empty".to_string()));
        }
        if message.chars().count() > MESSAGE_MAX_CHARS {
            return Err(Error::Validation(format!(
                "message exceeds {MESSAGE_MAX_CHARS} characters"
            )));
        }

        self.rate_limiter.acquire(request.user.id).await?;

        let conversation = match request.conversation_id {
            Some(id) => self.conversations.get_owned(request.user.id, id).await?,
            None => self.conversations.create(request.user.id, &message).await?,
        };

        let (tx, rx) = mpsc::channel(16);
        let this = self.clone();
        let user = request.user.clone();
        let personality_name = request.personality_name.clone();
        tokio::spawn(async move {
            this.run_turn(user, conversation, message, personality_name, tx)
                .await;
        });
        Ok(rx)
    }

    async fn turn_lock(&self, conversation_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.turn_locks.lock().await;
        locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn run_turn(
        self: Arc<Self>,
        user: AuthedUser,
        conversation: Conversation,
        message: String,
        personality_name: Option<String>,
        tx: mpsc::Sender<ChatEvent>,
    ) {
        // Per-conversation serialization: held until the terminal event
        let lock = self.turn_lock(conversation.id).await;
        let _guard = lock.lock().await;

        let request_id = Uuid::new_v4().to_string();
        let session = self.sessions.get_or_create(user.id, conversation.id).await;

        if !emit(&tx, ChatEvent::ProcessingStart {
            request_id: request_id.clone(),
            conversation_id: conversation.id,
        })
        .await
        {
            return;
        }

        // Persist the user message before anything can fail downstream
        if let Err(e) = self.persist_message(conversation.id, "user", &message).await {
            emit_error(&tx, "persistence", &e.to_string()).await;
            return;
        }

        // Classify, unless the session route is locked
        let locked = self.sessions.locked_route(&session).await;
        let (classification, freshly_classified) = match locked {
            Some(route) => (synthetic_classification(route), false),
            None => {
                let deadline = Duration::from_millis(self.config.classify_deadline_ms);
                match tokio::time::timeout(deadline, self.classifier.classify(&message)).await {
                    Ok(classification) => (classification, true),
                    Err(_) => {
                        emit_error(&tx, "classification", "classification deadline exceeded")
                            .await;
                        return;
                    }
                }
            }
        };

        let normalized = normalize(&message);
        if let Err(e) = self
            .audit
            .record(&request_id, user.id, &normalized, &classification)
            .await
        {
            tracing::warn!("audit write failed: {e}");
        }

        if !emit(&tx, ChatEvent::Classification {
            label: classification.label.as_str().to_string(),
            confidence: classification.confidence,
            layer_results: serde_json::to_value(&classification.layer_results)
                .unwrap_or_default(),
        })
        .await
        {
            return;
        }

        let route = match locked {
            Some(route) => route,
            None => route_for(classification.label),
        };

        // Gate: refusal surfaces as a normal assistant message
        if route == Route::Refused {
            let _ = emit(&tx, ChatEvent::PromptBuilt {
                sections: 0,
                memories: 0,
                history_messages: 0,
            })
            .await;
            if let Err(e) = self
                .persist_message(conversation.id, "assistant", REFUSAL_MESSAGE)
                .await
            {
                tracing::warn!("persisting refusal failed: {e}");
            }
            let _ = emit(&tx, ChatEvent::Chunk {
                content: REFUSAL_MESSAGE.to_string(),
                conversation_id: conversation.id,
            })
            .await;
            let _ = emit(&tx, ChatEvent::Done { conversation_id: conversation.id }).await;
            self.sessions
                .commit_route(user.id, conversation.id, &session, route, freshly_classified)
                .await;
            // No memory extraction on refused turns
            return;
        }

        // Gate: age verification
        if route.requires_age_verification() {
            let verified = { session.lock().await.age_verified };
            if !verified {
                let _ = emit(&tx, ChatEvent::AgeVerificationRequired {
                    conversation_id: conversation.id,
                    endpoint_hint: format!("/conversations/{}/verify-age", conversation.id),
                })
                .await;
                self.sessions
                    .commit_route(user.id, conversation.id, &session, route, freshly_classified)
                    .await;
                return;
            }
        }

        // Fan-out stage
        let fanout = self.fan_out(&user, &conversation, &message, personality_name.as_deref(), &tx)
            .await;

        // Assemble the model input
        let history = self.buffer.get(conversation.id).await.unwrap_or_default();
        let summary = self
            .buffer
            .get_summary(conversation.id)
            .await
            .ok()
            .flatten()
            .or(conversation.summary.clone());
        // The buffer already holds the current turn; history is everything
        // before it
        let history_prior = if history.is_empty() {
            &history[..]
        } else {
            &history[..history.len() - 1]
        };

        let inputs = PromptInputs {
            base_persona: &self.config.base_persona,
            personality: fanout.personality.as_ref(),
            preferences: &fanout.preferences,
            emotion: fanout.emotion.as_ref(),
            emotion_trend: fanout.emotion_trend,
            goals: &fanout.active_goals,
            goal_outcome: &fanout.goal_outcome,
            memories: &fanout.memories,
            summary: summary.as_deref(),
            history: history_prior,
            current_message: &message,
            token_budget: self.config.prompt_token_budget,
        };
        let prompt = assemble(&inputs);

        if !emit(&tx, ChatEvent::PromptBuilt {
            sections: prompt.sections,
            memories: prompt.memories_used,
            history_messages: prompt.history_used,
        })
        .await
        {
            return;
        }

        // Stream the assistant response
        let provider = self.llm.chat();
        let messages = prompt.messages.clone();
        let connect_deadline = Duration::from_millis(self.config.first_chunk_deadline_ms);
        let stream = tokio::time::timeout(
            connect_deadline,
            retry_transient(2, || {
                let provider = provider.clone();
                let messages = messages.clone();
                async move { provider.chat_stream(messages, Some(LlmParams::default())).await }
            }),
        )
        .await;

        let mut stream = match stream {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                emit_error(&tx, "llm", &e.to_string()).await;
                self.sessions
                    .commit_route(user.id, conversation.id, &session, route, freshly_classified)
                    .await;
                return;
            }
            Err(_) => {
                emit_error(&tx, "llm", "no response before deadline").await;
                self.sessions
                    .commit_route(user.id, conversation.id, &session, route, freshly_classified)
                    .await;
                return;
            }
        };

        let mut assistant_text = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(content) => {
                    assistant_text.push_str(&content);
                    if !emit(&tx, ChatEvent::Chunk {
                        content,
                        conversation_id: conversation.id,
                    })
                    .await
                    {
                        // Client disconnected: cancel the stream, skip
                        // extraction for this turn
                        return;
                    }
                }
                Err(e) => {
                    emit_error(&tx, "llm", &e.to_string()).await;
                    self.sessions
                        .commit_route(user.id, conversation.id, &session, route, freshly_classified)
                        .await;
                    return;
                }
            }
        }

        if let Err(e) = self
            .persist_message(conversation.id, "assistant", &assistant_text)
            .await
        {
            tracing::warn!("persisting assistant message failed: {e}");
        }
        let _ = emit(&tx, ChatEvent::Done { conversation_id: conversation.id }).await;
        self.sessions
            .commit_route(user.id, conversation.id, &session, route, freshly_classified)
            .await;

        // Background extraction after the terminal event
        self.schedule_extraction(&user, &conversation, &fanout).await;
    }

    async fn persist_message(&self, conversation_id: Uuid, role: &str, content: &str) -> Result<()> {
        self.buffer
            .append(conversation_id, BufferedMessage::new(role, content))
            .await?;
        self.conversations
            .append_message(conversation_id, role, content)
            .await
    }

    /// Run the five fan-out subtasks concurrently, each under the stage
    /// deadline, each degrading to its default and emitting a `thinking`
    /// event on completion.
    async fn fan_out(
        &self,
        user: &AuthedUser,
        conversation: &Conversation,
        message: &str,
        personality_name: Option<&str>,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> FanoutOutcome {
        let deadline = Duration::from_millis(self.config.fanout_deadline_ms);

        let prefs_task = async {
            let result = tokio::time::timeout(
                deadline,
                self.preferences.extract_and_update(user.id, message),
            )
            .await;
            match result {
                Ok(Ok((prefs, changed))) => {
                    let detail = if changed { "preferences updated" } else { "no change" };
                    think(tx, "preferences", detail).await;
                    prefs
                }
                Ok(Err(e)) => {
                    tracing::warn!("preference update failed: {e}");
                    think(tx, "preferences", "unavailable").await;
                    Preferences::default()
                }
                Err(_) => {
                    think(tx, "preferences", "timed out").await;
                    Preferences::default()
                }
            }
        };

        let personality_task = async {
            let result = tokio::time::timeout(deadline, async {
                let mut profile = self.personalities.resolve(user.id, personality_name).await?;
                if let Some(archetype) = detect_archetype_change(message) {
                    profile = self
                        .personalities
                        .apply_archetype(user.id, &profile, archetype)
                        .await?;
                }
                anyhow::Ok(profile)
            })
            .await;
            match result {
                Ok(Ok(profile)) => {
                    think(tx, "personality", &profile.name.clone()).await;
                    Some(profile)
                }
                Ok(Err(e)) => {
                    tracing::warn!("personality resolution failed: {e}");
                    think(tx, "personality", "unavailable").await;
                    None
                }
                Err(_) => {
                    think(tx, "personality", "timed out").await;
                    None
                }
            }
        };

        let emotion_task = async {
            let result = tokio::time::timeout(deadline, async {
                let utility = self.llm.utility();
                let reading =
                    detect_hybrid(message, Some(&utility), self.config.judge_threshold).await;
                if let Some(reading) = &reading {
                    self.emotions
                        .record(user.id, Some(conversation.id), reading, message)
                        .await?;
                }
                let trend = match &reading {
                    Some(_) => Some(self.emotions.trend(user.id, 7).await?),
                    None => None,
                };
                anyhow::Ok((reading, trend))
            })
            .await;
            match result {
                Ok(Ok((reading, trend))) => {
                    let detail = reading
                        .as_ref()
                        .map(|r| r.label.as_str())
                        .unwrap_or("neutral");
                    think(tx, "emotion", detail).await;
                    (reading, trend)
                }
                Ok(Err(e)) => {
                    tracing::warn!("emotion detection failed: {e}");
                    think(tx, "emotion", "unavailable").await;
                    (None, None)
                }
                Err(_) => {
                    think(tx, "emotion", "timed out").await;
                    (None, None)
                }
            }
        };

        let goals_task = async {
            let result = tokio::time::timeout(deadline, async {
                let outcome = self.goals.detect_and_track(user.id, message).await?;
                let active = self.goals.list(user.id, Some(GoalStatus::Active)).await?;
                anyhow::Ok((outcome, active))
            })
            .await;
            match result {
                Ok(Ok((outcome, active))) => {
                    let detail = format!(
                        "{} new, {} updates",
                        outcome.new_goals.len(),
                        outcome.progress_updates.len()
                    );
                    think(tx, "goals", &detail).await;
                    (outcome, active)
                }
                Ok(Err(e)) => {
                    tracing::warn!("goal tracking failed: {e}");
                    think(tx, "goals", "unavailable").await;
                    (GoalTrackingOutcome::default(), Vec::new())
                }
                Err(_) => {
                    think(tx, "goals", "timed out").await;
                    (GoalTrackingOutcome::default(), Vec::new())
                }
            }
        };

        let retrieval_task = async {
            let result =
                tokio::time::timeout(deadline, self.retrieve_memories(user.id, None, message))
                    .await;
            match result {
                Ok(Ok(memories)) => {
                    think(tx, "retrieval", &format!("{} memories", memories.len())).await;
                    memories
                }
                Ok(Err(e)) => {
                    // Embedding failure degrades to "no memories"
                    tracing::warn!("memory retrieval degraded: {e}");
                    think(tx, "retrieval", "unavailable, continuing without memories").await;
                    Vec::new()
                }
                Err(_) => {
                    think(tx, "retrieval", "timed out, continuing without memories").await;
                    Vec::new()
                }
            }
        };

        let (preferences, personality, (emotion, emotion_trend), (goal_outcome, active_goals), memories) = tokio::join!(
            prefs_task,
            personality_task,
            emotion_task,
            goals_task,
            retrieval_task
        );

        // Retrieval scoped to the resolved personality profile
        let memories = match (&personality, memories.is_empty()) {
            (Some(profile), false) => memories
                .into_iter()
                .filter(|(m, _)| m.personality_id.is_none() || m.personality_id == Some(profile.id))
                .collect(),
            _ => memories,
        };

        FanoutOutcome {
            preferences,
            personality,
            emotion,
            emotion_trend,
            goal_outcome,
            active_goals,
            memories,
        }
    }

    /// Embed the message, search the store, rank by the combined score and
    /// record access on the winners.
    async fn retrieve_memories(
        &self,
        user_id: Uuid,
        personality_id: Option<Uuid>,
        message: &str,
    ) -> Result<Vec<(Memory, f32)>> {
        let embedder = self.embedder.clone();
        let query = retry_transient(2, || {
            let embedder = embedder.clone();
            let text = message.to_string();
            async move { embedder.embed(&text).await }
        })
        .await?;

        let raw = self
            .store
            .search_similar(
                user_id,
                personality_id,
                &query,
                self.config.retrieval_k * 2,
                self.config.retrieval_min_similarity,
                &SearchFilters::default(),
            )
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        let now = chrono::Utc::now().timestamp();
        let ranked = rank_memories(raw, now, self.config.decay_half_life_days);
        let top: Vec<(Memory, f32)> =
            ranked.into_iter().take(self.config.retrieval_k).collect();

        for (memory, _) in &top {
            if let Err(e) = self.store.update_access(memory.id).await {
                tracing::debug!("access bookkeeping failed: {e}");
            }
        }
        Ok(top)
    }

    async fn schedule_extraction(
        &self,
        user: &AuthedUser,
        conversation: &Conversation,
        fanout: &FanoutOutcome,
    ) {
        let extractor = self.extractor.clone();
        let buffer = self.buffer.clone();
        let conversations = self.conversations.clone();
        let llm = self.llm.utility();
        let user_id = user.id;
        let conversation_id = conversation.id;
        let personality_id = fanout.personality.as_ref().map(|p| p.id);
        let emotion_intensity = fanout
            .emotion
            .as_ref()
            .map(|r| r.intensity.as_score())
            .unwrap_or(0.0);
        let buffer_capacity = self.config.buffer_size;

        tokio::spawn(async move {
            let context = buffer.get(conversation_id).await.unwrap_or_default();
            extractor
                .extract_and_store(
                    user_id,
                    personality_id,
                    conversation_id,
                    &context,
                    emotion_intensity,
                )
                .await;

            // Regenerate the rolling summary once the window is full so
            // evicted turns stay represented
            if context.len() >= buffer_capacity {
                let prior = buffer.get_summary(conversation_id).await.ok().flatten();
                match summarize(&llm, prior.as_deref(), &context).await {
                    Ok(summary) if !summary.is_empty() => {
                        let _ = buffer.set_summary(conversation_id, summary.clone()).await;
                        let _ = conversations.set_summary(conversation_id, &summary).await;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!("summary regeneration failed: {e}"),
                }
            }
        });
    }
}

/// Combined retrieval ranking: `0.6·similarity + 0.3·importance·decay +
/// 0.1·recency`. Ties break toward the newer `updated_at`.
pub fn rank_memories(
    results: Vec<(Memory, f32)>,
    now: i64,
    half_life_days: f64,
) -> Vec<(Memory, f32)> {
    let mut ranked: Vec<(Memory, f32)> = results
        .into_iter()
        .map(|(memory, similarity)| {
            let age_days = (now - memory.created_at).max(0) as f64 / 86_400.0;
            let decay = (0.5f64).powf(age_days / half_life_days).clamp(0.05, 1.0);
            let recency = 1.0 / (1.0 + age_days / 30.0);
            let score = 0.6 * similarity as f64 + 0.3 * memory.importance * decay + 0.1 * recency;
            (memory, score as f32)
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.0.updated_at.cmp(&a.0.updated_at))
    });
    ranked
}

fn synthetic_classification(route: Route) -> Classification {
    let label = match route {
        Route::Explicit => SafetyLabel::ExplicitConsensualAdult,
        Route::Fetish => SafetyLabel::Fetish,
        Route::Refused => SafetyLabel::Refused,
        Route::Normal | Route::Romance => SafetyLabel::Safe,
    };
    Classification {
        label,
        confidence: 1.0,
        reasoning: "route-locked".to_string(),
        layer_results: vec![LayerOutcome::RouteLocked { route: route.as_str().to_string() }],
    }
}

async fn summarize(
    llm: &Arc<dyn crate::llm::ChatProvider>,
    prior: Option<&str>,
    context: &[BufferedMessage],
) -> anyhow::Result<String> {
    let transcript = context
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");
    let prior_block = prior
        .map(|s| format!("Existing summary:\n{s}\n\n"))
        .unwrap_or_default();
    let prompt = format!(
        "{prior_block}Update the running summary of this conversation in at most four \
         sentences. Keep only durable facts and the current topic. Output only the summary.\n\n\
         Recent messages:\n{transcript}"
    );
    let summary = llm
        .chat(
            vec![crate::llm::ChatMessage::user(prompt)],
            Some(LlmParams::utility(160)),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(summary.trim().to_string())
}

async fn emit(tx: &mpsc::Sender<ChatEvent>, event: ChatEvent) -> bool {
    tx.send(event).await.is_ok()
}

async fn emit_error(tx: &mpsc::Sender<ChatEvent>, kind: &str, detail: &str) {
    let _ = tx
        .send(ChatEvent::Error {
            error: kind.to_string(),
            detail: detail.to_string(),
        })
        .await;
}

async fn think(tx: &mpsc::Sender<ChatEvent>, step: &str, detail: &str) {
    let _ = tx
        .send(ChatEvent::Thinking {
            step: step.to_string(),
            detail: detail.to_string(),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::memory::{ImportanceScores, MemoryCategory, RelatedEntities};

    fn memory_with(importance: f64, created_at: i64, updated_at: i64) -> Memory {
        let mut m = Memory::new(
            Uuid::new_v4(),
            None,
            None,
            "m".to_string(),
            vec![0.0; 4],
            MemoryCategory::Fact,
            ImportanceScores::uniform(importance),
            RelatedEntities::default(),
        );
        m.created_at = created_at;
        m.updated_at = updated_at;
        m
    }

    #[test]
    fn ranking_weights_similarity_highest() {
        let now = 1_700_000_000;
        let fresh = memory_with(0.5, now, now);
        let results = vec![
            (fresh.clone(), 0.9f32),
            (memory_with(0.9, now, now), 0.4f32),
        ];
        let ranked = rank_memories(results, now, 30.0);
        assert_eq!(ranked[0].0.id, fresh.id);
    }

    #[test]
    fn older_memories_decay_in_rank() {
        let now = 1_700_000_000;
        let old = memory_with(0.8, now - 120 * 86_400, now - 120 * 86_400);
        let new = memory_with(0.8, now, now);
        let ranked = rank_memories(vec![(old, 0.7), (new.clone(), 0.7)], now, 30.0);
        assert_eq!(ranked[0].0.id, new.id);
    }

    #[test]
    fn ties_break_toward_newer_updated_at() {
        let now = 1_700_000_000;
        let older = memory_with(0.5, now, now - 100);
        let newer = memory_with(0.5, now, now);
        let ranked = rank_memories(vec![(older, 0.8), (newer.clone(), 0.8)], now, 30.0);
        assert_eq!(ranked[0].0.id, newer.id);
    }

    #[test]
    fn synthetic_classifications_are_route_locked() {
        let c = synthetic_classification(Route::Explicit);
        assert_eq!(c.label, SafetyLabel::ExplicitConsensualAdult);
        assert!((c.confidence - 1.0).abs() < 1e-6);
        assert_eq!(c.reasoning, "route-locked");
        assert!(matches!(c.layer_results[0], LayerOutcome::RouteLocked { .. }));
    }
}
