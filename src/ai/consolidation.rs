//! Memory consolidation — keeps the long-term store free of duplicates.
//!
//! Each candidate is compared against its nearest existing memories:
//! near-identical facts are merged, refinements update in place,
//! contradictions supersede the old memory, and everything else inserts
//! as new. Superseded memories stay inactive forever.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::ai::memory::{Memory, MemoryCategory, MemoryStore, SearchFilters};
use crate::embedding::Embedder;
use crate::llm::{ChatMessage, ChatProvider, LlmParams};

/// Neighbors considered per candidate.
const NEIGHBOR_K: usize = 5;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConsolidationOutcome {
    Merged { id: Uuid, absorbed: Vec<Uuid> },
    Updated { id: Uuid },
    Superseded { old: Uuid, new: Uuid },
    Inserted { id: Uuid },
}

pub struct ConsolidationEngine {
    store: Arc<MemoryStore>,
    embedder: Arc<dyn Embedder>,
    llm: Option<Arc<dyn ChatProvider>>,
    min_similarity: f32,
    merge_similarity: f32,
}

impl ConsolidationEngine {
    pub fn new(
        store: Arc<MemoryStore>,
        embedder: Arc<dyn Embedder>,
        llm: Option<Arc<dyn ChatProvider>>,
        min_similarity: f32,
        merge_similarity: f32,
    ) -> Self {
        Self { store, embedder, llm, min_similarity, merge_similarity }
    }

    /// Consolidate one candidate against the user's existing memories and
    /// persist the result. Callers hold the per-user extraction mutex.
    pub async fn consolidate(&self, candidate: Memory) -> Result<ConsolidationOutcome> {
        let neighbors = self
            .store
            .search_similar(
                candidate.user_id,
                candidate.personality_id,
                &candidate.embedding,
                NEIGHBOR_K,
                self.min_similarity,
                &SearchFilters::default(),
            )
            .await?;

        let Some((nearest, similarity)) = neighbors.first().cloned() else {
            let id = self.store.store(&candidate).await?;
            return Ok(ConsolidationOutcome::Inserted { id });
        };

        // Contradictions supersede regardless of how close the texts are;
        // merging a contradiction would fuse both claims into one memory
        if similarity >= self.min_similarity
            && self.contradicts(&nearest.content, &candidate.content).await
        {
            let id = self.store.store(&candidate).await?;
            self.store.supersede(nearest.id, id).await?;
            return Ok(ConsolidationOutcome::Superseded { old: nearest.id, new: id });
        }

        // merge: near-identical and category-compatible
        if similarity >= self.merge_similarity
            && categories_compatible(nearest.category, candidate.category)
        {
            return self.merge(candidate, neighbors).await;
        }

        // update: same category, new text refines the old
        if similarity >= self.min_similarity
            && nearest.category == candidate.category
            && refines(&nearest.content, &candidate.content)
        {
            let mut updated = nearest.clone();
            updated.content = candidate.content.clone();
            updated.embedding = candidate.embedding.clone();
            updated.importance_scores = if candidate.importance > nearest.importance {
                candidate.importance_scores.clone()
            } else {
                nearest.importance_scores.clone()
            };
            updated.importance = updated.importance_scores.aggregate();
            updated.related_entities.merge(&candidate.related_entities);
            self.store.update(&updated).await?;
            return Ok(ConsolidationOutcome::Updated { id: updated.id });
        }

        let id = self.store.store(&candidate).await?;
        Ok(ConsolidationOutcome::Inserted { id })
    }

    /// Merge the candidate with every near-identical neighbor into one
    /// memory: deduplicated text, union of entities, max importance, fresh
    /// embedding. Originals are deactivated and linked via
    /// `consolidated_from`.
    async fn merge(
        &self,
        candidate: Memory,
        neighbors: Vec<(Memory, f32)>,
    ) -> Result<ConsolidationOutcome> {
        let close: Vec<&Memory> = neighbors
            .iter()
            .filter(|(m, sim)| {
                *sim >= self.merge_similarity && categories_compatible(m.category, candidate.category)
            })
            .map(|(m, _)| m)
            .collect();

        let mut texts: Vec<&str> = close.iter().map(|m| m.content.as_str()).collect();
        texts.push(&candidate.content);
        let merged_text = self.merge_texts(&texts).await;

        let embedding = if merged_text == candidate.content {
            candidate.embedding.clone()
        } else {
            self.embedder.embed(&merged_text).await.unwrap_or_else(|e| {
                tracing::warn!("re-embedding merged memory failed, reusing candidate: {e}");
                candidate.embedding.clone()
            })
        };

        let mut merged = candidate.clone();
        merged.id = Uuid::new_v4();
        merged.content = merged_text;
        merged.embedding = embedding;
        merged.consolidated_from = close.iter().map(|m| m.id).collect();
        for old in &close {
            if old.importance > merged.importance {
                merged.importance_scores = old.importance_scores.clone();
                merged.importance = old.importance;
            }
            merged.related_entities.merge(&old.related_entities);
        }

        let id = self.store.store(&merged).await?;
        let absorbed: Vec<Uuid> = close.iter().map(|m| m.id).collect();
        for old_id in &absorbed {
            self.store.deactivate(*old_id).await?;
        }
        Ok(ConsolidationOutcome::Merged { id, absorbed })
    }

    /// Text merge without redundancy: LLM when available, otherwise keep
    /// the longest variant (near-identical texts by construction).
    async fn merge_texts(&self, texts: &[&str]) -> String {
        if let Some(provider) = &self.llm {
            let facts_list = texts
                .iter()
                .enumerate()
                .map(|(i, f)| format!("{}. {}", i + 1, f))
                .collect::<Vec<_>>()
                .join("\n");
            let prompt = format!(
                "Merge the following near-duplicate facts about a user into one concise, \
                 complete memory entry. Preserve every distinct detail, add nothing. \
                 Output only the merged text.\n\nFacts:\n{facts_list}"
            );
            match provider
                .chat(vec![ChatMessage::user(prompt)], Some(LlmParams::utility(150)))
                .await
            {
                Ok(merged) if !merged.trim().is_empty() => return merged.trim().to_string(),
                Ok(_) => {}
                Err(e) => tracing::warn!("merge call failed, falling back: {e}"),
            }
        }
        texts
            .iter()
            .max_by_key(|t| t.len())
            .map(|t| t.to_string())
            .unwrap_or_default()
    }

    /// Contradiction pass: pattern check first, LLM confirmation when
    /// available and the patterns are inconclusive.
    async fn contradicts(&self, old: &str, new: &str) -> bool {
        match detect_contradiction(old, new) {
            Some(verdict) => verdict,
            None => {
                let Some(provider) = &self.llm else { return false };
                let prompt = format!(
                    "Do these two statements about the same user contradict each other? \
                     Answer with exactly YES or NO.\nA: {old}\nB: {new}"
                );
                match provider
                    .chat(vec![ChatMessage::user(prompt)], Some(LlmParams::utility(5)))
                    .await
                {
                    Ok(reply) => reply.trim().to_uppercase().starts_with("YES"),
                    Err(_) => false,
                }
            }
        }
    }
}

/// `fact` and `context` merge with anything; otherwise categories must
/// match.
fn categories_compatible(a: MemoryCategory, b: MemoryCategory) -> bool {
    a == b
        || matches!(a, MemoryCategory::Fact | MemoryCategory::Context)
        || matches!(b, MemoryCategory::Fact | MemoryCategory::Context)
}

/// New text refines old when it carries the old content forward and says
/// more.
fn refines(old: &str, new: &str) -> bool {
    let old_tokens = significant_tokens(old);
    if old_tokens.is_empty() {
        return false;
    }
    let new_tokens = significant_tokens(new);
    let covered = old_tokens.intersection(&new_tokens).count();
    covered as f64 / old_tokens.len() as f64 >= 0.8 && new.len() > old.len()
}

fn significant_tokens(text: &str) -> HashSet<String> {
    const STOPWORDS: &[&str] = &["the", "a", "an", "is", "are", "was", "my", "i", "to", "of", "and", "in"];
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1 && !STOPWORDS.contains(w))
        .map(String::from)
        .collect()
}

const NEGATION_MARKERS: &[&str] = &[
    "not ",
    "no longer",
    "never",
    "stopped",
    "quit",
    "don't",
    "dont",
    "doesn't",
    "hate",
    "dislike",
];

/// Pattern-level contradiction check. `Some(true)` = contradiction,
/// `Some(false)` = clearly consistent, `None` = inconclusive.
pub fn detect_contradiction(old: &str, new: &str) -> Option<bool> {
    let old_lower = old.to_lowercase();
    let new_lower = new.to_lowercase();

    let old_neg = NEGATION_MARKERS.iter().any(|m| old_lower.contains(m));
    let new_neg = NEGATION_MARKERS.iter().any(|m| new_lower.contains(m));

    let old_tokens = significant_tokens(old);
    let new_tokens = significant_tokens(new);
    let shared = old_tokens.intersection(&new_tokens).count();
    let overlap = shared as f64 / old_tokens.len().max(1) as f64;

    // Same subject, opposite polarity
    if overlap >= 0.4 && old_neg != new_neg {
        return Some(true);
    }

    // "favorite X is A" vs "favorite X is B"
    if let (Some(old_value), Some(new_value)) =
        (favorite_value(&old_lower), favorite_value(&new_lower))
    {
        return Some(old_value != new_value);
    }

    if overlap >= 0.6 && old_neg == new_neg {
        return Some(false);
    }
    None
}

fn favorite_value(text: &str) -> Option<String> {
    let idx = text.find("favorite")?;
    let rest = &text[idx..];
    let is_idx = rest.find(" is ")?;
    let value = rest[is_idx + 4..]
        .trim()
        .trim_end_matches(['.', '!', '?'])
        .to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
