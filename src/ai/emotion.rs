//! User emotion detection — keyword lexicons, emoji and phrase patterns
//! combined into one of twelve labels with confidence and intensity.
//!
//! Records are append-only; the service exposes recent history, per-label
//! statistics and a sentiment trend over a configurable window.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::ai::categorizer::strip_code_fences;
use crate::llm::{ChatMessage, ChatProvider, LlmParams};

/// Snippet stored alongside each record, capped at 100 chars.
const SNIPPET_MAX: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmotionLabel {
    Joy,
    Sadness,
    Anger,
    Fear,
    Surprise,
    Disgust,
    Anticipation,
    Trust,
    Frustration,
    Excitement,
    Anxiety,
    Contentment,
}

impl EmotionLabel {
    pub const ALL: [EmotionLabel; 12] = [
        EmotionLabel::Joy,
        EmotionLabel::Sadness,
        EmotionLabel::Anger,
        EmotionLabel::Fear,
        EmotionLabel::Surprise,
        EmotionLabel::Disgust,
        EmotionLabel::Anticipation,
        EmotionLabel::Trust,
        EmotionLabel::Frustration,
        EmotionLabel::Excitement,
        EmotionLabel::Anxiety,
        EmotionLabel::Contentment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionLabel::Joy => "joy",
            EmotionLabel::Sadness => "sadness",
            EmotionLabel::Anger => "anger",
            EmotionLabel::Fear => "fear",
            EmotionLabel::Surprise => "surprise",
            EmotionLabel::Disgust => "disgust",
            EmotionLabel::Anticipation => "anticipation",
            EmotionLabel::Trust => "trust",
            EmotionLabel::Frustration => "frustration",
            EmotionLabel::Excitement => "excitement",
            EmotionLabel::Anxiety => "anxiety",
            EmotionLabel::Contentment => "contentment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|l| l.as_str() == s)
    }

    /// Valence in [-1, 1] for trend computation.
    pub fn valence(&self) -> f64 {
        match self {
            EmotionLabel::Joy => 1.0,
            EmotionLabel::Excitement => 0.9,
            EmotionLabel::Contentment => 0.8,
            EmotionLabel::Trust => 0.6,
            EmotionLabel::Anticipation => 0.4,
            EmotionLabel::Surprise => 0.1,
            EmotionLabel::Disgust => -0.6,
            EmotionLabel::Frustration => -0.6,
            EmotionLabel::Anger => -0.7,
            EmotionLabel::Fear => -0.7,
            EmotionLabel::Anxiety => -0.7,
            EmotionLabel::Sadness => -0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    Low,
    Medium,
    High,
}

impl Intensity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intensity::Low => "low",
            Intensity::Medium => "medium",
            Intensity::High => "high",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "high" => Intensity::High,
            "medium" => Intensity::Medium,
            _ => Intensity::Low,
        }
    }

    pub fn as_score(&self) -> f64 {
        match self {
            Intensity::Low => 0.3,
            Intensity::Medium => 0.6,
            Intensity::High => 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionReading {
    pub label: EmotionLabel,
    pub confidence: f32,
    pub intensity: Intensity,
    pub indicators: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionRecord {
    pub user_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub label: EmotionLabel,
    pub confidence: f32,
    pub intensity: Intensity,
    pub indicators: Vec<String>,
    pub snippet: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentTrend {
    Improving,
    Stable,
    Declining,
}

// ── Lexicons ───────────────────────────────────────────

const KEYWORDS: &[(EmotionLabel, &[&str])] = &[
    (EmotionLabel::Joy, &["happy", "glad", "wonderful", "delighted", "joyful", "great day", "amazing day", "so good"]),
    (EmotionLabel::Sadness, &["sad", "down", "depressed", "miserable", "heartbroken", "crying", "lonely", "miss him", "miss her"]),
    (EmotionLabel::Anger, &["angry", "furious", "mad at", "outraged", "pissed", "infuriating"]),
    (EmotionLabel::Fear, &["scared", "afraid", "terrified", "frightened", "dread"]),
    (EmotionLabel::Surprise, &["surprised", "can't believe", "cant believe", "shocked", "unexpected", "wow"]),
    (EmotionLabel::Disgust, &["disgusting", "gross", "revolting", "sickening"]),
    (EmotionLabel::Anticipation, &["can't wait", "cant wait", "looking forward", "excited for", "counting down"]),
    (EmotionLabel::Trust, &["i trust", "rely on", "count on", "believe in you"]),
    (EmotionLabel::Frustration, &["frustrated", "frustrating", "annoyed", "annoying", "fed up", "sick of", "ugh"]),
    (EmotionLabel::Excitement, &["excited", "thrilled", "pumped", "stoked", "hyped"]),
    (EmotionLabel::Anxiety, &["anxious", "worried", "nervous", "stressed", "overwhelmed", "on edge", "panicking"]),
    (EmotionLabel::Contentment, &["content", "peaceful", "relaxed", "at ease", "satisfied", "grateful"]),
];

const EMOJI: &[(EmotionLabel, &[&str])] = &[
    (EmotionLabel::Joy, &["😊", "😄", "😁", "🙂", "☺"]),
    (EmotionLabel::Sadness, &["😢", "😭", "💔", "😞"]),
    (EmotionLabel::Anger, &["😡", "🤬", "😠"]),
    (EmotionLabel::Fear, &["😨", "😱"]),
    (EmotionLabel::Surprise, &["😮", "😲", "🤯"]),
    (EmotionLabel::Disgust, &["🤢", "🤮"]),
    (EmotionLabel::Excitement, &["🎉", "🥳", "🤩", "✨"]),
    (EmotionLabel::Anxiety, &["😰", "😅", "😬"]),
    (EmotionLabel::Contentment, &["😌", "🙏"]),
];

const INTENSIFIERS: &[&str] = &["very", "so ", "extremely", "really", "incredibly", "absolutely", "totally", "completely"];

/// Keyword + emoji + phrase detection. Returns `None` when nothing fires.
pub fn detect(text: &str) -> Option<EmotionReading> {
    let lower = text.to_lowercase();
    let mut hits: HashMap<EmotionLabel, Vec<String>> = HashMap::new();

    for (label, keywords) in KEYWORDS {
        for kw in *keywords {
            if lower.contains(kw) {
                hits.entry(*label).or_default().push((*kw).to_string());
            }
        }
    }
    for (label, emoji) in EMOJI {
        for e in *emoji {
            if text.contains(e) {
                hits.entry(*label).or_default().push((*e).to_string());
            }
        }
    }

    let (label, indicators) = hits
        .into_iter()
        .max_by_key(|(label, indicators)| (indicators.len(), label.as_str().len()))?;

    let confidence = (0.4 + 0.2 * indicators.len() as f32).min(0.95);

    let exclamations = text.matches('!').count();
    let intensified = INTENSIFIERS.iter().any(|i| lower.contains(i));
    let shouting = text.chars().filter(|c| c.is_uppercase()).count() > text.len() / 3
        && text.len() > 8;
    let intensity = match (intensified || shouting, exclamations) {
        (true, _) | (_, 2..) => Intensity::High,
        (false, 1) => Intensity::Medium,
        _ => Intensity::Medium,
    };
    let intensity = if indicators.len() == 1 && !intensified && exclamations == 0 {
        Intensity::Low
    } else {
        intensity
    };

    Some(EmotionReading { label, confidence, intensity, indicators })
}

const EMOTION_JUDGE_PROMPT: &str = concat!(
    "Identify the dominant emotion in the user's message. Choose exactly one label from: ",
    "joy, sadness, anger, fear, surprise, disgust, anticipation, trust, frustration, ",
    "excitement, anxiety, contentment.\n",
    "Respond with ONLY a JSON object: {\"label\": \"...\", \"confidence\": 0.0-1.0, ",
    "\"intensity\": \"low|medium|high\"}."
);

#[derive(Debug, Deserialize)]
struct EmotionVerdict {
    label: String,
    confidence: f32,
    intensity: Option<String>,
}

/// Hybrid detection: run the pattern pass, then escalate to the LLM when
/// the pattern confidence is below `threshold`. The LLM result is used
/// only when it parses and names a known label.
pub async fn detect_hybrid(
    text: &str,
    provider: Option<&Arc<dyn ChatProvider>>,
    threshold: f32,
) -> Option<EmotionReading> {
    let pattern = detect(text);
    let confident_enough = pattern
        .as_ref()
        .is_some_and(|r| r.confidence >= threshold);
    if confident_enough {
        return pattern;
    }

    let Some(provider) = provider else { return pattern };
    let messages = vec![
        ChatMessage::system(EMOTION_JUDGE_PROMPT),
        ChatMessage::user(text.to_string()),
    ];
    match provider.chat(messages, Some(LlmParams::utility(80))).await {
        Ok(reply) => {
            let cleaned = strip_code_fences(&reply);
            if let Ok(verdict) = serde_json::from_str::<EmotionVerdict>(cleaned) {
                if let Some(label) = EmotionLabel::parse(&verdict.label) {
                    return Some(EmotionReading {
                        label,
                        confidence: verdict.confidence.clamp(0.0, 1.0),
                        intensity: Intensity::parse(verdict.intensity.as_deref().unwrap_or("medium")),
                        indicators: vec!["llm".to_string()],
                    });
                }
            }
            pattern
        }
        Err(e) => {
            tracing::debug!("emotion judge unavailable: {e}");
            pattern
        }
    }
}

// ── Service ────────────────────────────────────────────

pub struct EmotionService {
    db: SqlitePool,
}

impl EmotionService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn record(
        &self,
        user_id: Uuid,
        conversation_id: Option<Uuid>,
        reading: &EmotionReading,
        source_text: &str,
    ) -> Result<()> {
        let snippet: String = source_text.chars().take(SNIPPET_MAX).collect();
        sqlx::query(
            "INSERT INTO emotions \
             (user_id, conversation_id, emotion, confidence, intensity, indicators, snippet, detected_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id.to_string())
        .bind(conversation_id.map(|c| c.to_string()))
        .bind(reading.label.as_str())
        .bind(reading.confidence as f64)
        .bind(reading.intensity.as_str())
        .bind(serde_json::to_string(&reading.indicators)?)
        .bind(snippet)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn history(&self, user_id: Uuid, limit: i64) -> Result<Vec<EmotionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM emotions WHERE user_id = ? ORDER BY detected_at DESC LIMIT ?",
        )
        .bind(user_id.to_string())
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    /// Per-label counts within the window.
    pub async fn statistics(
        &self,
        user_id: Uuid,
        window_days: i64,
    ) -> Result<HashMap<String, i64>> {
        let cutoff = (Utc::now() - ChronoDuration::days(window_days)).to_rfc3339();
        let rows = sqlx::query(
            "SELECT emotion, COUNT(*) as cnt FROM emotions \
             WHERE user_id = ? AND detected_at >= ? GROUP BY emotion",
        )
        .bind(user_id.to_string())
        .bind(cutoff)
        .fetch_all(&self.db)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("emotion"), r.get::<i64, _>("cnt")))
            .collect())
    }

    /// Compare average valence of the newer half of the window against the
    /// older half.
    pub async fn trend(&self, user_id: Uuid, window_days: i64) -> Result<SentimentTrend> {
        let cutoff = (Utc::now() - ChronoDuration::days(window_days)).to_rfc3339();
        let rows = sqlx::query(
            "SELECT emotion, intensity FROM emotions \
             WHERE user_id = ? AND detected_at >= ? ORDER BY detected_at ASC",
        )
        .bind(user_id.to_string())
        .bind(cutoff)
        .fetch_all(&self.db)
        .await?;

        let valences: Vec<f64> = rows
            .iter()
            .filter_map(|r| {
                let label = EmotionLabel::parse(&r.get::<String, _>("emotion"))?;
                let intensity = Intensity::parse(&r.get::<String, _>("intensity"));
                Some(label.valence() * intensity.as_score())
            })
            .collect();

        Ok(trend_from_valences(&valences))
    }
}

pub fn trend_from_valences(valences: &[f64]) -> SentimentTrend {
    if valences.len() < 4 {
        return SentimentTrend::Stable;
    }
    let mid = valences.len() / 2;
    let older: f64 = valences[..mid].iter().sum::<f64>() / mid as f64;
    let newer: f64 = valences[mid..].iter().sum::<f64>() / (valences.len() - mid) as f64;
    let delta = newer - older;
    if delta > 0.15 {
        SentimentTrend::Improving
    } else if delta < -0.15 {
        SentimentTrend::Declining
    } else {
        SentimentTrend::Stable
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<EmotionRecord> {
    let user_id: String = row.get("user_id");
    let conversation_id: Option<String> = row.get("conversation_id");
    let emotion: String = row.get("emotion");
    let indicators: String = row.get("indicators");
    let detected_at: String = row.get("detected_at");
    Ok(EmotionRecord {
        user_id: Uuid::parse_str(&user_id)?,
        conversation_id: conversation_id
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()?,
        label: EmotionLabel::parse(&emotion)
            .ok_or_else(|| anyhow::anyhow!("unknown emotion label: {emotion}"))?,
        confidence: row.get::<f64, _>("confidence") as f32,
        intensity: Intensity::parse(&row.get::<String, _>("intensity")),
        indicators: serde_json::from_str(&indicators).unwrap_or_default(),
        snippet: row.get("snippet"),
        detected_at: DateTime::parse_from_rfc3339(&detected_at)?.with_timezone(&Utc),
    })
}
