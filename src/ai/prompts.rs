//! Prompt assembly — a pure function from structured context to the model
//! input.
//!
//! Sections appear in a fixed order; the CRITICAL COMMUNICATION
//! REQUIREMENTS block is inviolate and survives every trim. When the soft
//! token cap is exceeded, memories are dropped first, then the rolling
//! summary, then the oldest buffered messages — never the current user
//! turn.

use crate::ai::buffer::BufferedMessage;
use crate::ai::emotion::{EmotionReading, SentimentTrend};
use crate::ai::goals::{Goal, GoalTrackingOutcome};
use crate::ai::memory::Memory;
use crate::ai::personality::PersonalityProfile;
use crate::ai::preferences::Preferences;
use crate::llm::ChatMessage;

pub struct PromptInputs<'a> {
    pub base_persona: &'a str,
    pub personality: Option<&'a PersonalityProfile>,
    pub preferences: &'a Preferences,
    pub emotion: Option<&'a EmotionReading>,
    pub emotion_trend: Option<SentimentTrend>,
    pub goals: &'a [Goal],
    pub goal_outcome: &'a GoalTrackingOutcome,
    pub memories: &'a [(Memory, f32)],
    pub summary: Option<&'a str>,
    pub history: &'a [BufferedMessage],
    pub current_message: &'a str,
    pub token_budget: usize,
}

#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub messages: Vec<ChatMessage>,
    pub sections: usize,
    pub memories_used: usize,
    pub history_used: usize,
}

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn prompt_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

pub fn assemble(inputs: &PromptInputs<'_>) -> AssembledPrompt {
    // Start with the maximum context and trim down to the budget
    let mut memories_used = inputs.memories.len().min(5);
    let mut history_start = 0usize;
    let mut include_summary = inputs.summary.is_some_and(|s| !s.is_empty());

    loop {
        let built = build(inputs, memories_used, include_summary, history_start);
        if prompt_tokens(&built.messages) <= inputs.token_budget {
            return built;
        }
        if memories_used > 0 {
            memories_used -= 1;
        } else if include_summary {
            include_summary = false;
        } else if history_start < inputs.history.len() {
            history_start += 1;
        } else {
            // Nothing left to trim: the current turn and the critical
            // block always survive
            return built;
        }
    }
}

fn build(
    inputs: &PromptInputs<'_>,
    memories_used: usize,
    include_summary: bool,
    history_start: usize,
) -> AssembledPrompt {
    let mut messages = Vec::new();
    let mut sections = 0usize;

    // 1. Base persona
    messages.push(ChatMessage::system(inputs.base_persona.to_string()));
    sections += 1;

    // 2. Personality
    if let Some(profile) = inputs.personality {
        messages.push(ChatMessage::system(personality_block(profile)));
        sections += 1;
    }

    // 3. Critical communication requirements — inviolate
    if let Some(block) = critical_requirements_block(inputs.preferences) {
        messages.push(ChatMessage::system(block));
        sections += 1;
    }

    // 4. Emotion context
    if let Some(reading) = inputs.emotion {
        messages.push(ChatMessage::system(emotion_block(reading, inputs.emotion_trend)));
        sections += 1;
    }

    // 5. Goal context
    if let Some(block) = goal_block(inputs.goals, inputs.goal_outcome) {
        messages.push(ChatMessage::system(block));
        sections += 1;
    }

    // 6. Retrieved memories
    if memories_used > 0 {
        let block = inputs.memories[..memories_used]
            .iter()
            .map(|(m, _)| {
                format!(
                    "- [{}][importance≈{:.1}] {}",
                    m.category.as_str(),
                    m.importance,
                    m.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        messages.push(ChatMessage::system(format!(
            "You remember these things about the user:\n{block}\n\n\
             Weave them in naturally when relevant; never recite them as a list."
        )));
        sections += 1;
    }

    // 7. Rolling summary
    if include_summary {
        if let Some(summary) = inputs.summary {
            messages.push(ChatMessage::system(format!(
                "Summary of the earlier conversation:\n{summary}"
            )));
            sections += 1;
        }
    }

    // 8. Buffered history, role-tagged
    let history = &inputs.history[history_start.min(inputs.history.len())..];
    for msg in history {
        messages.push(ChatMessage {
            role: msg.role.clone(),
            content: msg.content.clone(),
        });
    }

    // 9. The current user turn — always last, never trimmed
    messages.push(ChatMessage::user(inputs.current_message.to_string()));

    AssembledPrompt {
        messages,
        sections,
        memories_used,
        history_used: history.len(),
    }
}

fn personality_block(profile: &PersonalityProfile) -> String {
    let t = &profile.traits;
    let mut block = format!(
        "Personality: {} ({}).\nTrait levels (0-10): warmth {}, humor {}, formality {}, \
         curiosity {}, empathy {}, assertiveness {}, playfulness {}, patience {}.",
        profile.name,
        profile.archetype,
        t.warmth,
        t.humor,
        t.formality,
        t.curiosity,
        t.empathy,
        t.assertiveness,
        t.playfulness,
        t.patience,
    );

    let b = &profile.behaviors;
    let mut behaviors = Vec::new();
    if b.asks_questions {
        behaviors.push("ask follow-up questions");
    }
    if b.uses_examples {
        behaviors.push("illustrate with examples");
    }
    if b.admits_uncertainty {
        behaviors.push("admit uncertainty openly");
    }
    if b.offers_encouragement {
        behaviors.push("offer encouragement");
    }
    if b.checks_understanding {
        behaviors.push("check the user's understanding");
    }
    if !behaviors.is_empty() {
        block.push_str(&format!("\nBehaviors: {}.", behaviors.join(", ")));
    }
    if let Some(style) = &profile.speaking_style {
        block.push_str(&format!("\nSpeaking style: {style}"));
    }
    if let Some(backstory) = &profile.backstory {
        block.push_str(&format!("\nBackstory: {backstory}"));
    }
    if let Some(instructions) = &profile.custom_instructions {
        block.push_str(&format!("\nAdditional instructions: {instructions}"));
    }
    block
}

/// MUST-directives for every non-null preference. Returns `None` when the
/// user has not set anything.
pub fn critical_requirements_block(prefs: &Preferences) -> Option<String> {
    let mut directives = Vec::new();

    if let Some(language) = &prefs.language {
        directives.push(format!(
            "You MUST respond ENTIRELY in {language}, regardless of the language the user writes in."
        ));
    }
    if let Some(formality) = &prefs.formality {
        directives.push(format!("You MUST maintain a {formality} register at all times."));
    }
    if let Some(tone) = &prefs.tone {
        directives.push(format!("You MUST keep a {tone} tone."));
    }
    match prefs.emoji_usage {
        Some(true) => directives.push("You MUST include fitting emoji in your responses.".to_string()),
        Some(false) => directives.push("You MUST NOT use any emoji.".to_string()),
        None => {}
    }
    if let Some(length) = &prefs.response_length {
        let directive = match length.as_str() {
            "brief" => "You MUST keep responses brief: at most 3 sentences.",
            "detailed" => "You MUST answer in detail, covering the topic thoroughly.",
            _ => "You MUST keep responses balanced in length.",
        };
        directives.push(directive.to_string());
    }
    if let Some(style) = &prefs.explanation_style {
        let directive = match style.as_str() {
            "simple" => "You MUST explain things in simple, everyday terms.",
            "technical" => "You MUST explain with full technical precision.",
            _ => "You MUST explain using analogies.",
        };
        directives.push(directive.to_string());
    }

    if directives.is_empty() {
        return None;
    }
    Some(format!(
        "CRITICAL COMMUNICATION REQUIREMENTS — these override all other style guidance:\n{}",
        directives
            .iter()
            .map(|d| format!("- {d}"))
            .collect::<Vec<_>>()
            .join("\n")
    ))
}

fn emotion_block(reading: &EmotionReading, trend: Option<SentimentTrend>) -> String {
    let mut block = format!(
        "The user currently seems to feel {} ({} intensity, confidence {:.2}). \
         Acknowledge their state with genuine empathy before anything else.",
        reading.label.as_str(),
        reading.intensity.as_str(),
        reading.confidence
    );
    if trend == Some(SentimentTrend::Declining) {
        block.push_str(
            "\nTheir mood has been declining recently; be especially gentle and supportive.",
        );
    }
    block
}

fn goal_block(goals: &[Goal], outcome: &GoalTrackingOutcome) -> Option<String> {
    if goals.is_empty() && outcome.is_empty() {
        return None;
    }
    let mut lines = Vec::new();

    if !goals.is_empty() {
        lines.push("The user's active goals:".to_string());
        for goal in goals.iter().take(5) {
            lines.push(format!(
                "- {} [{}] ({:.0}% done)",
                goal.title,
                goal.category.as_str(),
                goal.progress
            ));
        }
    }
    for goal in &outcome.new_goals {
        lines.push(format!(
            "The user just set a new goal: \"{}\". Acknowledge it supportively.",
            goal.title
        ));
    }
    for update in &outcome.progress_updates {
        lines.push(format!(
            "The user mentioned progress on \"{}\" ({} / {}).",
            update.goal_title,
            update.progress_type.as_str(),
            update.sentiment.as_str()
        ));
    }
    for goal in &outcome.completions {
        lines.push(format!(
            "The user just completed their goal \"{}\" — celebrate this achievement warmly!",
            goal.title
        ));
    }

    Some(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::memory::{ImportanceScores, Memory, MemoryCategory, RelatedEntities};
    use uuid::Uuid;

    fn memory(content: &str) -> (Memory, f32) {
        (
            Memory::new(
                Uuid::new_v4(),
                None,
                None,
                content.to_string(),
                vec![0.0; 4],
                MemoryCategory::PersonalFact,
                ImportanceScores::uniform(0.5),
                RelatedEntities::default(),
            ),
            0.9,
        )
    }

    fn base_inputs<'a>(
        prefs: &'a Preferences,
        outcome: &'a GoalTrackingOutcome,
    ) -> PromptInputs<'a> {
        PromptInputs {
            base_persona: "You are a helpful companion.",
            personality: None,
            preferences: prefs,
            emotion: None,
            emotion_trend: None,
            goals: &[],
            goal_outcome: outcome,
            memories: &[],
            summary: None,
            history: &[],
            current_message: "hello",
            token_budget: 6000,
        }
    }

    #[test]
    fn every_non_null_preference_yields_a_must_directive() {
        let prefs = Preferences {
            language: Some("Spanish".to_string()),
            formality: Some("casual".to_string()),
            tone: Some("calm".to_string()),
            emoji_usage: Some(false),
            response_length: Some("brief".to_string()),
            explanation_style: Some("simple".to_string()),
        };
        let block = critical_requirements_block(&prefs).unwrap();
        assert!(block.contains("MUST respond ENTIRELY in Spanish"));
        assert!(block.contains("MUST maintain a casual register"));
        assert!(block.contains("MUST keep a calm tone"));
        assert!(block.contains("MUST NOT use any emoji"));
        assert!(block.contains("at most 3 sentences"));
        assert!(block.contains("simple, everyday terms"));
    }

    #[test]
    fn no_preferences_no_block() {
        assert!(critical_requirements_block(&Preferences::default()).is_none());
    }

    #[test]
    fn current_message_is_always_last() {
        let prefs = Preferences::default();
        let outcome = GoalTrackingOutcome::default();
        let inputs = base_inputs(&prefs, &outcome);
        let prompt = assemble(&inputs);
        let last = prompt.messages.last().unwrap();
        assert_eq!(last.role, "user");
        assert_eq!(last.content, "hello");
    }

    #[test]
    fn over_budget_trims_memories_then_summary_then_history() {
        let prefs = Preferences {
            language: Some("French".to_string()),
            ..Default::default()
        };
        let outcome = GoalTrackingOutcome::default();
        let memories: Vec<_> = (0..3).map(|i| memory(&format!("fact {i} {}", "x".repeat(200)))).collect();
        let history: Vec<_> = (0..4)
            .map(|i| BufferedMessage::new("user", format!("old message {i} {}", "y".repeat(200))))
            .collect();

        let mut inputs = base_inputs(&prefs, &outcome);
        inputs.memories = &memories;
        inputs.summary = Some("a long summary of earlier talk");
        inputs.history = &history;
        // A budget that forces everything optional out
        inputs.token_budget = 60;

        let prompt = assemble(&inputs);
        assert_eq!(prompt.memories_used, 0);
        assert_eq!(prompt.history_used, 0);
        // Critical block and current turn both survive
        assert!(prompt
            .messages
            .iter()
            .any(|m| m.content.contains("CRITICAL COMMUNICATION REQUIREMENTS")));
        assert_eq!(prompt.messages.last().unwrap().content, "hello");
    }

    #[test]
    fn memories_render_with_category_and_importance() {
        let prefs = Preferences::default();
        let outcome = GoalTrackingOutcome::default();
        let memories = vec![memory("likes sushi")];
        let mut inputs = base_inputs(&prefs, &outcome);
        inputs.memories = &memories;

        let prompt = assemble(&inputs);
        let block = prompt
            .messages
            .iter()
            .find(|m| m.content.contains("You remember"))
            .unwrap();
        assert!(block.content.contains("[personal_fact]"));
        assert!(block.content.contains("likes sushi"));
        assert_eq!(prompt.memories_used, 1);
    }

    #[test]
    fn assembly_is_pure() {
        let prefs = Preferences::default();
        let outcome = GoalTrackingOutcome::default();
        let inputs = base_inputs(&prefs, &outcome);
        let a = assemble(&inputs);
        let b = assemble(&inputs);
        let a_contents: Vec<_> = a.messages.iter().map(|m| &m.content).collect();
        let b_contents: Vec<_> = b.messages.iter().map(|m| &m.content).collect();
        assert_eq!(a_contents, b_contents);
    }
}
