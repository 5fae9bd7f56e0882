//! Memory categorization and entity extraction.
//!
//! The fast path is a keyword pass over the content; hybrid mode asks the
//! utility LLM for a structured verdict and keeps it only when confident.
//! Categorization of identical text is deterministic.

use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::OnceLock;

use crate::ai::memory::{MemoryCategory, RelatedEntities};
use crate::llm::{ChatMessage, ChatProvider, LlmParams};

/// Below this LLM confidence the pattern result wins.
const HYBRID_CONFIDENCE_FLOOR: f32 = 0.6;

const CATEGORY_KEYWORDS: &[(MemoryCategory, &[&str])] = &[
    (
        MemoryCategory::Preference,
        &["favorite", "favourite", "prefer", "love", "like", "enjoy", "hate", "dislike", "can't stand"],
    ),
    (
        MemoryCategory::Goal,
        &["want to", "goal", "plan to", "hope to", "dream of", "aiming", "trying to", "wish to"],
    ),
    (
        MemoryCategory::Relationship,
        &["my wife", "my husband", "my partner", "my friend", "my mom", "my dad", "my mother",
          "my father", "my sister", "my brother", "my son", "my daughter", "my boss", "my colleague"],
    ),
    (
        MemoryCategory::Event,
        &["yesterday", "last week", "tomorrow", "next week", "birthday", "anniversary", "wedding",
          "meeting", "appointment", "happened", "went to"],
    ),
    (
        MemoryCategory::Challenge,
        &["struggling", "difficult", "hard time", "problem with", "worried about", "anxious",
          "stressed", "can't seem to", "failing"],
    ),
    (
        MemoryCategory::Achievement,
        &["finished", "completed", "achieved", "won", "passed", "graduated", "promoted",
          "accomplished", "proud of"],
    ),
    (
        MemoryCategory::Instruction,
        &["always", "never", "please do", "don't ever", "make sure to", "from now on", "call me"],
    ),
    (
        MemoryCategory::Knowledge,
        &["learned", "studied", "read about", "understand", "know how to", "skilled in", "expert"],
    ),
    (
        MemoryCategory::PersonalFact,
        &["my name", "i am", "i'm", "i live", "i work", "years old", "born in", "allergic",
          "my job", "i do"],
    ),
];

/// Keyword pass over the content. Falls back to `fact` for statements and
/// `context` for everything else.
pub fn categorize(content: &str) -> (MemoryCategory, f32) {
    let lower = content.to_lowercase();

    let mut best: Option<(MemoryCategory, usize)> = None;
    for (category, keywords) in CATEGORY_KEYWORDS {
        let hits = keywords.iter().filter(|kw| lower.contains(*kw)).count();
        if hits > 0 && best.map_or(true, |(_, prev)| hits > prev) {
            best = Some((*category, hits));
        }
    }

    match best {
        Some((category, hits)) => {
            let confidence = (0.5 + 0.15 * hits as f32).min(0.95);
            (category, confidence)
        }
        None if lower.contains(" is ") || lower.contains(" are ") => (MemoryCategory::Fact, 0.4),
        None => (MemoryCategory::Context, 0.3),
    }
}

#[derive(Debug, Deserialize)]
struct CategoryVerdict {
    category: String,
    confidence: f32,
    #[allow(dead_code)]
    reasoning: Option<String>,
}

const CATEGORIZE_PROMPT: &str = concat!(
    "You classify a single remembered fact about a user into exactly one category from this list: ",
    "personal_fact, preference, goal, event, relationship, challenge, achievement, knowledge, ",
    "instruction, fact, context.\n",
    "Respond with ONLY a JSON object: {\"category\": \"...\", \"confidence\": 0.0-1.0, ",
    "\"reasoning\": \"...\"}. No markdown, no explanation."
);

/// Hybrid categorization: consult the LLM first; when its confidence is
/// below the floor (or the reply is unusable) the pattern result wins.
pub async fn categorize_hybrid(
    content: &str,
    provider: &Arc<dyn ChatProvider>,
) -> MemoryCategory {
    let (pattern_category, _) = categorize(content);

    let messages = vec![
        ChatMessage::system(CATEGORIZE_PROMPT),
        ChatMessage::user(content.to_string()),
    ];

    match provider.chat(messages, Some(LlmParams::utility(100))).await {
        Ok(reply) => {
            let cleaned = strip_code_fences(&reply);
            match serde_json::from_str::<CategoryVerdict>(cleaned) {
                Ok(verdict) if verdict.confidence >= HYBRID_CONFIDENCE_FLOOR => {
                    MemoryCategory::parse(&verdict.category).unwrap_or(pattern_category)
                }
                _ => pattern_category,
            }
        }
        Err(e) => {
            tracing::debug!("hybrid categorization unavailable: {e}");
            pattern_category
        }
    }
}

// ── Entity extraction ──────────────────────────────────

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:my (?:friend|wife|husband|partner|mom|dad|sister|brother|boss|colleague|son|daughter) )([A-Z][a-z]+)|\b([A-Z][a-z]+ [A-Z][a-z]+)\b").expect("name regex")
    })
}

fn place_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:in|at|from|to|near) ([A-Z][a-zA-Z]+(?: [A-Z][a-zA-Z]+)?)\b")
            .expect("place regex")
    })
}

fn date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}(?:/\d{2,4})?|(?:january|february|march|april|may|june|july|august|september|october|november|december) \d{1,2}(?:st|nd|rd|th)?(?:,? \d{4})?|tomorrow|yesterday|today|next (?:week|month|year)|last (?:week|month|year))\b",
        )
        .expect("date regex")
    })
}

fn topic_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:about|into|learning|studying|working on|interested in) ([a-z][a-z ]{2,30}?)(?:[,.!?]|$)")
            .expect("topic regex")
    })
}

/// Regex capture of people, places, topics and dates mentioned in content.
pub fn extract_entities(content: &str) -> RelatedEntities {
    let mut entities = RelatedEntities::default();

    for caps in name_regex().captures_iter(content) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
            push_unique(&mut entities.people, m.as_str().trim());
        }
    }
    for caps in place_regex().captures_iter(content) {
        if let Some(m) = caps.get(1) {
            let place = m.as_str().trim();
            // A captured two-word name is a person, not a place
            if !entities.people.iter().any(|p| p == place) {
                push_unique(&mut entities.places, place);
            }
        }
    }
    for caps in date_regex().captures_iter(content) {
        if let Some(m) = caps.get(1) {
            push_unique(&mut entities.dates, m.as_str().trim());
        }
    }
    for caps in topic_regex().captures_iter(content) {
        if let Some(m) = caps.get(1) {
            push_unique(&mut entities.topics, m.as_str().trim());
        }
    }

    entities
}

fn push_unique(items: &mut Vec<String>, value: &str) {
    if !value.is_empty() && !items.iter().any(|i| i == value) {
        items.push(value.to_string());
    }
}

/// Strip markdown code fences if present.
pub(crate) fn strip_code_fences(response: &str) -> &str {
    let trimmed = response.trim();
    if trimmed.starts_with("```") {
        trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
    } else {
        trimmed
    }
}
