//! Background memory extraction.
//!
//! After a turn completes, the user and assistant messages plus short-term
//! context are sent to the utility LLM, which returns zero or more
//! candidate facts. Each candidate is categorized, entity-tagged,
//! importance-scored, embedded and passed through consolidation. Writes
//! are serialized per user so consolidation sees a consistent snapshot.

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::ai::buffer::BufferedMessage;
use crate::ai::categorizer::{categorize, extract_entities, strip_code_fences};
use crate::ai::consolidation::{ConsolidationEngine, ConsolidationOutcome};
use crate::ai::importance::{score, ImportanceContext};
use crate::ai::memory::{Memory, MemoryStore, SearchFilters};
use crate::embedding::Embedder;
use crate::llm::{ChatMessage, ChatProvider, LlmParams};

/// Storage writes during extraction are retried this many times.
const STORAGE_ATTEMPTS: u32 = 3;

const EXTRACTION_PROMPT: &str = concat!(
    "You are a memory extraction assistant. Analyze the conversation and extract noteworthy ",
    "facts worth remembering about the user for future conversations.\n\n",
    "Extract facts such as:\n",
    "- The user's name, preferences, hobbies, or personal details\n",
    "- Important events, dates, or plans mentioned\n",
    "- The user's opinions or feelings about specific topics\n",
    "- Relationships, goals, challenges, or achievements\n\n",
    "For each fact, assign an importance score from 0.0 to 1.0:\n",
    "- 0.9-1.0: Critical personal info (name, birthday, major life events)\n",
    "- 0.7-0.8: Strong preferences or important plans\n",
    "- 0.5-0.6: Interesting details or opinions\n",
    "- 0.3-0.4: Minor observations or casual mentions\n\n",
    "Respond with ONLY a JSON array of objects: [{\"fact\": \"...\", \"importance\": 0.8}]\n",
    "If nothing noteworthy was said, respond with [].\n\n",
    "IMPORTANT: Output ONLY the JSON array, no explanation or markdown."
);

#[derive(Debug, Deserialize)]
struct ScoredFact {
    fact: String,
    #[serde(default = "default_importance")]
    importance: f64,
}

fn default_importance() -> f64 {
    0.5
}

pub struct MemoryExtractor {
    store: Arc<MemoryStore>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn ChatProvider>,
    consolidation: Arc<ConsolidationEngine>,
    user_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl MemoryExtractor {
    pub fn new(
        store: Arc<MemoryStore>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn ChatProvider>,
        consolidation: Arc<ConsolidationEngine>,
    ) -> Self {
        Self {
            store,
            embedder,
            llm,
            consolidation,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn user_lock(&self, user_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run one extraction pass. Designed for fire-and-forget background
    /// tasks: failures are logged and never affect the delivered response.
    pub async fn extract_and_store(
        &self,
        user_id: Uuid,
        personality_id: Option<Uuid>,
        conversation_id: Uuid,
        context: &[BufferedMessage],
        emotion_intensity: f64,
    ) -> Vec<ConsolidationOutcome> {
        if context.is_empty() {
            return Vec::new();
        }

        let facts = match self.extract_facts(user_id, personality_id, context).await {
            Ok(facts) => facts,
            Err(e) => {
                tracing::warn!("memory extraction failed: {e}");
                return Vec::new();
            }
        };
        if facts.is_empty() {
            tracing::debug!("no noteworthy facts this turn");
            return Vec::new();
        }

        // Serialize writes per user so consolidation decisions see a
        // consistent snapshot
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        let mut outcomes = Vec::new();
        for fact in facts {
            match self
                .build_candidate(user_id, personality_id, conversation_id, &fact, emotion_intensity)
                .await
            {
                Ok(candidate) => {
                    match self.consolidate_with_retry(candidate).await {
                        Ok(outcome) => outcomes.push(outcome),
                        Err(e) => tracing::warn!("storing memory '{}' failed: {e}", fact.fact),
                    }
                }
                Err(e) => tracing::warn!("embedding candidate '{}' failed: {e}", fact.fact),
            }
        }
        tracing::info!(
            user = %user_id,
            extracted = outcomes.len(),
            "memory extraction pass complete"
        );
        outcomes
    }

    async fn extract_facts(
        &self,
        user_id: Uuid,
        personality_id: Option<Uuid>,
        context: &[BufferedMessage],
    ) -> Result<Vec<ScoredFact>> {
        // Existing memories discourage duplicate extraction
        let existing = self
            .store
            .get_by_user_and_personality(user_id, personality_id, true)
            .await
            .unwrap_or_default();
        let existing_block = if existing.is_empty() {
            String::new()
        } else {
            let list = existing
                .iter()
                .take(50)
                .map(|m| format!("- {}", m.content))
                .collect::<Vec<_>>()
                .join("\n");
            format!(
                "\n\nYou already have these memories stored. Do NOT extract facts that are \
                 already covered below (even if worded differently):\n{list}"
            )
        };

        let transcript = context
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let messages = vec![
            ChatMessage::system(format!("{EXTRACTION_PROMPT}{existing_block}")),
            ChatMessage::user(format!("Conversation to analyze:\n\n{transcript}")),
        ];

        let llm = self.llm.clone();
        let response = crate::llm::retry_transient(2, || {
            let llm = llm.clone();
            let messages = messages.clone();
            async move { llm.chat(messages, Some(LlmParams::utility(400))).await }
        })
        .await?;
        Ok(parse_facts(&response))
    }

    async fn build_candidate(
        &self,
        user_id: Uuid,
        personality_id: Option<Uuid>,
        conversation_id: Uuid,
        fact: &ScoredFact,
        emotion_intensity: f64,
    ) -> Result<Memory> {
        let embedding = self.embedder.embed(&fact.fact).await?;

        // Frequency signal: similar facts already on record
        let similar = self
            .store
            .search_similar(
                user_id,
                personality_id,
                &embedding,
                5,
                0.75,
                &SearchFilters::default(),
            )
            .await
            .map(|v| v.len())
            .unwrap_or(0);

        let (category, _) = categorize(&fact.fact);
        let entities = extract_entities(&fact.fact);
        let mut scores = score(
            &fact.fact,
            &ImportanceContext {
                emotion_intensity,
                similar_prior_count: similar,
                age_days: 0.0,
            },
        );
        // The extractor's own estimate feeds the emotional axis when the
        // turn carried no detectable emotion
        if emotion_intensity == 0.0 {
            scores.emotional_significance = fact.importance.clamp(0.0, 1.0) * 0.5;
        }

        Ok(Memory::new(
            user_id,
            personality_id,
            Some(conversation_id),
            fact.fact.clone(),
            embedding,
            category,
            scores,
            entities,
        ))
    }

    async fn consolidate_with_retry(&self, candidate: Memory) -> Result<ConsolidationOutcome> {
        let mut last_err = None;
        for attempt in 1..=STORAGE_ATTEMPTS {
            match self.consolidation.consolidate(candidate.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    tracing::warn!(attempt, "consolidation write failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("consolidation failed")))
    }
}

/// Parse the LLM response as scored facts, falling back to a plain string
/// array.
fn parse_facts(response: &str) -> Vec<ScoredFact> {
    let json_str = strip_code_fences(response);
    if let Ok(items) = serde_json::from_str::<Vec<ScoredFact>>(json_str) {
        return items
            .into_iter()
            .filter(|s| !s.fact.trim().is_empty())
            .collect();
    }
    match serde_json::from_str::<Vec<String>>(json_str) {
        Ok(items) => items
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .map(|fact| ScoredFact { fact, importance: 0.5 })
            .collect(),
        Err(e) => {
            tracing::warn!(
                "unparsable extraction response: {e}; raw: {}",
                &response[..response.len().min(200)]
            );
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scored_facts() {
        let facts = parse_facts(r#"[{"fact": "Name is Alice", "importance": 0.9}]"#);
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].fact, "Name is Alice");
        assert!((facts[0].importance - 0.9).abs() < 1e-9);
    }

    #[test]
    fn falls_back_to_plain_strings() {
        let facts = parse_facts(r#"["Likes sushi", "Has a dog"]"#);
        assert_eq!(facts.len(), 2);
        assert!((facts[0].importance - 0.5).abs() < 1e-9);
    }

    #[test]
    fn strips_markdown_fences() {
        let facts = parse_facts("```json\n[{\"fact\": \"Works remotely\"}]\n```");
        assert_eq!(facts.len(), 1);
        assert!((facts[0].importance - 0.5).abs() < 1e-9);
    }

    #[test]
    fn garbage_yields_nothing() {
        assert!(parse_facts("I could not find any facts.").is_empty());
        assert!(parse_facts("[]").is_empty());
    }
}
