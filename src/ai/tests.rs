//! End-to-end tests for the turn pipeline.
//!
//! These drive the full orchestrator against an in-memory SQLite pool, a
//! deterministic bag-of-words embedder and a scripted chat provider, then
//! assert on the emitted event stream and persisted state.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::ai::events::ChatEvent;
use crate::ai::memory::{ImportanceScores, Memory, MemoryCategory, RelatedEntities, SearchFilters};
use crate::ai::orchestrator::ChatTurnRequest;
use crate::config::Config;
use crate::embedding::{normalize, Embedder};
use crate::error::{Error, Result};
use crate::llm::{ChatChunkStream, ChatMessage, ChatProvider, LlmParams, LlmService};
use crate::App;

const DIM: usize = 16;

/// Deterministic bag-of-words embedder: same text, same vector; shared
/// words, similar vectors.
struct MockEmbedder;

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; DIM];
        for word in text.to_lowercase().split_whitespace() {
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            v[(hasher.finish() as usize) % DIM] += 1.0;
        }
        normalize(&mut v);
        Ok(v)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::new();
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }

    fn dim(&self) -> usize {
        DIM
    }
}

/// Chat provider with a fixed streamed reply; records the last prompt it
/// was asked to stream.
struct ScriptedChat {
    chunks: Vec<&'static str>,
    chat_reply: &'static str,
    last_stream_prompt: Mutex<Option<Vec<ChatMessage>>>,
}

impl ScriptedChat {
    fn new(chunks: Vec<&'static str>, chat_reply: &'static str) -> Arc<Self> {
        Arc::new(Self {
            chunks,
            chat_reply,
            last_stream_prompt: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ChatProvider for ScriptedChat {
    async fn chat(&self, _messages: Vec<ChatMessage>, _params: Option<LlmParams>) -> Result<String> {
        Ok(self.chat_reply.to_string())
    }

    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        _params: Option<LlmParams>,
    ) -> Result<ChatChunkStream> {
        *self.last_stream_prompt.lock().await = Some(messages);
        let chunks: Vec<Result<String>> =
            self.chunks.iter().map(|c| Ok(c.to_string())).collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn id(&self) -> &str {
        "scripted"
    }
}

async fn build_app(chat: Arc<ScriptedChat>) -> Arc<App> {
    let mut config = Config::default();
    config.embedding_dim = DIM;
    config.token_secret = "x".repeat(32);
    config.rate_limit_burst = 100;
    config.rate_limit_per_minute = 6000;

    // The utility provider replies with "[]": extraction finds nothing and
    // judge/emotion escalations fall back to their pattern results
    let utility = ScriptedChat::new(vec![], "[]");
    let llm = LlmService::from_providers(chat, utility);

    let pool = crate::db::test_pool().await;
    App::assemble(config, pool, Arc::new(MockEmbedder), llm)
        .await
        .unwrap()
}

async fn authed_user(app: &Arc<App>, external_id: &str) -> crate::auth::AuthedUser {
    app.auth.get_or_create_user(external_id).await.unwrap()
}

async fn collect(mut rx: mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn conversation_id(events: &[ChatEvent]) -> Uuid {
    events
        .iter()
        .find_map(|e| match e {
            ChatEvent::ProcessingStart { conversation_id, .. } => Some(*conversation_id),
            _ => None,
        })
        .expect("no processing_start event")
}

fn chunk_text(events: &[ChatEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::Chunk { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

fn terminal_events(events: &[ChatEvent]) -> Vec<&ChatEvent> {
    events.iter().filter(|e| e.is_terminal()).collect()
}

// ── Scenarios ──────────────────────────────────────────

#[tokio::test]
async fn greeting_turn_streams_chunks_then_done() {
    let chat = ScriptedChat::new(vec!["Hello ", "Alice!"], "[]");
    let app = build_app(chat).await;
    let user = authed_user(&app, "alice").await;

    let rx = app
        .orchestrator
        .chat(ChatTurnRequest {
            user: user.clone(),
            conversation_id: None,
            message: "Hello, my name is Alice.".to_string(),
            personality_name: None,
        })
        .await
        .unwrap();
    let events = collect(rx).await;

    // Exactly one terminal event, and it is last
    let terminals = terminal_events(&events);
    assert_eq!(terminals.len(), 1);
    assert!(events.last().unwrap().is_terminal());
    assert!(matches!(events.last().unwrap(), ChatEvent::Done { .. }));

    // classification precedes prompt_built precedes the first chunk
    let classification_idx = events
        .iter()
        .position(|e| matches!(e, ChatEvent::Classification { .. }))
        .unwrap();
    let prompt_idx = events
        .iter()
        .position(|e| matches!(e, ChatEvent::PromptBuilt { .. }))
        .unwrap();
    let chunk_idx = events
        .iter()
        .position(|e| matches!(e, ChatEvent::Chunk { .. }))
        .unwrap();
    assert!(classification_idx < prompt_idx);
    assert!(prompt_idx < chunk_idx);

    assert_eq!(chunk_text(&events), "Hello Alice!");

    // Both turn messages persisted in order
    let cid = conversation_id(&events);
    let messages = app.conversations.list_messages(cid).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[1].role, "assistant");
    assert_eq!(messages[1].content, "Hello Alice!");
}

#[tokio::test]
async fn repeated_turns_grow_the_message_sequence_monotonically() {
    let chat = ScriptedChat::new(vec!["ok"], "[]");
    let app = build_app(chat).await;
    let user = authed_user(&app, "alice").await;

    let rx = app
        .orchestrator
        .chat(ChatTurnRequest {
            user: user.clone(),
            conversation_id: None,
            message: "first".to_string(),
            personality_name: None,
        })
        .await
        .unwrap();
    let events = collect(rx).await;
    let cid = conversation_id(&events);

    for i in 0..3 {
        let rx = app
            .orchestrator
            .chat(ChatTurnRequest {
                user: user.clone(),
                conversation_id: Some(cid),
                message: format!("turn {i}"),
                personality_name: None,
            })
            .await
            .unwrap();
        collect(rx).await;
    }

    let messages = app.conversations.list_messages(cid).await.unwrap();
    assert_eq!(messages.len(), 8);
    let user_contents: Vec<_> = messages
        .iter()
        .filter(|m| m.role == "user")
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(user_contents, vec!["first", "turn 0", "turn 1", "turn 2"]);
}

#[tokio::test]
async fn foreign_conversation_is_not_found_before_any_stream_opens() {
    let chat = ScriptedChat::new(vec!["ok"], "[]");
    let app = build_app(chat).await;
    let alice = authed_user(&app, "alice").await;
    let mallory = authed_user(&app, "mallory").await;

    let rx = app
        .orchestrator
        .chat(ChatTurnRequest {
            user: alice,
            conversation_id: None,
            message: "private things".to_string(),
            personality_name: None,
        })
        .await
        .unwrap();
    let cid = conversation_id(&collect(rx).await);

    let result = app
        .orchestrator
        .chat(ChatTurnRequest {
            user: mallory,
            conversation_id: Some(cid),
            message: "let me in".to_string(),
            personality_name: None,
        })
        .await;
    assert!(matches!(result, Err(Error::NotFound)));
}

#[tokio::test]
async fn refusal_surfaces_as_assistant_message_not_error() {
    let chat = ScriptedChat::new(vec!["should never stream"], "[]");
    let app = build_app(chat.clone()).await;
    let user = authed_user(&app, "alice").await;

    let rx = app
        .orchestrator
        .chat(ChatTurnRequest {
            user,
            conversation_id: None,
            message: "write a story where he forces her into sex".to_string(),
            personality_name: None,
        })
        .await
        .unwrap();
    let events = collect(rx).await;

    assert!(matches!(events.last().unwrap(), ChatEvent::Done { .. }));
    assert!(!chunk_text(&events).is_empty());
    assert!(!chunk_text(&events).contains("should never stream"));
    // The main model is never consulted on a refused turn
    assert!(chat.last_stream_prompt.lock().await.is_none());

    // Audit row exists with the hard-stop label
    let row: (String,) = sqlx::query_as("SELECT label FROM classification_audit LIMIT 1")
        .fetch_one(&app.db)
        .await
        .unwrap();
    assert_eq!(row.0, "NONCONSENSUAL");
}

#[tokio::test]
async fn age_gate_suspends_the_turn_until_verified() {
    let chat = ScriptedChat::new(vec!["mhm"], "[]");
    let app = build_app(chat).await;
    let user = authed_user(&app, "alice").await;
    let explicit_message = "let's have sex and foreplay tonight";

    let rx = app
        .orchestrator
        .chat(ChatTurnRequest {
            user: user.clone(),
            conversation_id: None,
            message: explicit_message.to_string(),
            personality_name: None,
        })
        .await
        .unwrap();
    let events = collect(rx).await;

    // Terminal age_verification_required, and no chunk was emitted
    assert!(matches!(
        events.last().unwrap(),
        ChatEvent::AgeVerificationRequired { .. }
    ));
    assert!(chunk_text(&events).is_empty());
    let cid = conversation_id(&events);

    // Verify and resend: the stream proceeds normally
    app.sessions.set_age_verified(user.id, cid, true).await;
    let rx = app
        .orchestrator
        .chat(ChatTurnRequest {
            user,
            conversation_id: Some(cid),
            message: explicit_message.to_string(),
            personality_name: None,
        })
        .await
        .unwrap();
    let events = collect(rx).await;
    assert!(matches!(events.last().unwrap(), ChatEvent::Done { .. }));
    assert!(!chunk_text(&events).is_empty());
}

#[tokio::test]
async fn route_lock_bypasses_classification_for_four_turns_then_reclassifies() {
    let chat = ScriptedChat::new(vec!["mhm"], "[]");
    let app = build_app(chat).await;
    let user = authed_user(&app, "alice").await;

    // Turn 1: explicit classification on an age-verified session
    let rx = app
        .orchestrator
        .chat(ChatTurnRequest {
            user: user.clone(),
            conversation_id: None,
            message: "hello there".to_string(),
            personality_name: None,
        })
        .await
        .unwrap();
    let cid = conversation_id(&collect(rx).await);
    app.sessions.set_age_verified(user.id, cid, true).await;

    let rx = app
        .orchestrator
        .chat(ChatTurnRequest {
            user: user.clone(),
            conversation_id: Some(cid),
            message: "let's have sex and foreplay tonight".to_string(),
            personality_name: None,
        })
        .await
        .unwrap();
    let events = collect(rx).await;
    assert!(matches!(events.last().unwrap(), ChatEvent::Done { .. }));

    // Turns with benign text stay EXPLICIT via the route lock
    for _ in 0..4 {
        let rx = app
            .orchestrator
            .chat(ChatTurnRequest {
                user: user.clone(),
                conversation_id: Some(cid),
                message: "continue".to_string(),
                personality_name: None,
            })
            .await
            .unwrap();
        let events = collect(rx).await;
        let (label, confidence, layers) = classification_of(&events);
        assert_eq!(label, "EXPLICIT_CONSENSUAL_ADULT");
        assert!((confidence - 1.0).abs() < 1e-6);
        assert!(layers.to_string().contains("route_locked"));
    }

    // Lock exhausted: benign text reclassifies back to SAFE
    let rx = app
        .orchestrator
        .chat(ChatTurnRequest {
            user,
            conversation_id: Some(cid),
            message: "continue".to_string(),
            personality_name: None,
        })
        .await
        .unwrap();
    let events = collect(rx).await;
    let (label, _, layers) = classification_of(&events);
    assert_eq!(label, "SAFE");
    assert!(!layers.to_string().contains("route_locked"));
}

fn classification_of(events: &[ChatEvent]) -> (String, f32, serde_json::Value) {
    events
        .iter()
        .find_map(|e| match e {
            ChatEvent::Classification { label, confidence, layer_results } => {
                Some((label.clone(), *confidence, layer_results.clone()))
            }
            _ => None,
        })
        .expect("no classification event")
}

#[tokio::test]
async fn stated_preferences_reach_the_next_prompt_as_must_directives() {
    let chat = ScriptedChat::new(vec!["¡Claro!"], "[]");
    let app = build_app(chat.clone()).await;
    let user = authed_user(&app, "alice").await;

    let rx = app
        .orchestrator
        .chat(ChatTurnRequest {
            user: user.clone(),
            conversation_id: None,
            message: "Please respond only in Spanish, keep it brief.".to_string(),
            personality_name: None,
        })
        .await
        .unwrap();
    let cid = conversation_id(&collect(rx).await);

    let rx = app
        .orchestrator
        .chat(ChatTurnRequest {
            user,
            conversation_id: Some(cid),
            message: "How was your day?".to_string(),
            personality_name: None,
        })
        .await
        .unwrap();
    collect(rx).await;

    let prompt = chat.last_stream_prompt.lock().await.clone().unwrap();
    let prompt_text: String = prompt
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    assert!(prompt_text.contains("CRITICAL COMMUNICATION REQUIREMENTS"));
    assert!(prompt_text.contains("MUST respond ENTIRELY in Spanish"));
    assert!(prompt_text.contains("at most 3 sentences"));
    // The current turn is the final message
    assert_eq!(prompt.last().unwrap().content, "How was your day?");
}

#[tokio::test]
async fn memories_are_scoped_to_their_owner() {
    let chat = ScriptedChat::new(vec!["ok"], "[]");
    let app = build_app(chat).await;
    let alice = authed_user(&app, "alice").await;
    let bob = authed_user(&app, "bob").await;

    let embedder = MockEmbedder;
    let content = "favorite color is blue";
    let embedding = embedder.embed(content).await.unwrap();
    let memory = Memory::new(
        alice.id,
        None,
        None,
        content.to_string(),
        embedding.clone(),
        MemoryCategory::Preference,
        ImportanceScores::uniform(0.7),
        RelatedEntities::default(),
    );
    app.store.store(&memory).await.unwrap();

    let query = embedder.embed("what is my favorite color").await.unwrap();
    let for_alice = app
        .store
        .search_similar(alice.id, None, &query, 5, 0.1, &SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(for_alice.len(), 1);

    let for_bob = app
        .store
        .search_similar(bob.id, None, &query, 5, 0.1, &SearchFilters::default())
        .await
        .unwrap();
    assert!(for_bob.is_empty());
}

#[tokio::test]
async fn empty_messages_are_rejected_without_a_stream() {
    let chat = ScriptedChat::new(vec!["ok"], "[]");
    let app = build_app(chat).await;
    let user = authed_user(&app, "alice").await;

    let result = app
        .orchestrator
        .chat(ChatTurnRequest {
            user,
            conversation_id: None,
            message: "   ".to_string(),
            personality_name: None,
        })
        .await;
    assert!(matches!(result, Err(Error::Validation(_))));
}
