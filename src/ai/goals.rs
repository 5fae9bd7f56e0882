//! Goal detection and tracking.
//!
//! New goals are detected from explicit ("my goal is to ...") and implicit
//! ("I want to ...") patterns, categorized by keyword and optionally given
//! a target date. Later mentions are matched against active goals by
//! keyword overlap and logged as progress entries; completion phrases
//! close the goal at 100%.

use anyhow::Result;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::sync::OnceLock;
use uuid::Uuid;

/// Keyword-overlap floor for matching a message against an active goal.
const PROGRESS_MATCH_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalCategory {
    Learning,
    Health,
    Career,
    Financial,
    Personal,
    Creative,
    Social,
}

impl GoalCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalCategory::Learning => "learning",
            GoalCategory::Health => "health",
            GoalCategory::Career => "career",
            GoalCategory::Financial => "financial",
            GoalCategory::Personal => "personal",
            GoalCategory::Creative => "creative",
            GoalCategory::Social => "social",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "learning" => Some(GoalCategory::Learning),
            "health" => Some(GoalCategory::Health),
            "career" => Some(GoalCategory::Career),
            "financial" => Some(GoalCategory::Financial),
            "personal" => Some(GoalCategory::Personal),
            "creative" => Some(GoalCategory::Creative),
            "social" => Some(GoalCategory::Social),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Active,
    Completed,
    Paused,
    Abandoned,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalStatus::Active => "active",
            GoalStatus::Completed => "completed",
            GoalStatus::Paused => "paused",
            GoalStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(GoalStatus::Active),
            "completed" => Some(GoalStatus::Completed),
            "paused" => Some(GoalStatus::Paused),
            "abandoned" => Some(GoalStatus::Abandoned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressType {
    Mention,
    Update,
    Milestone,
    Setback,
    Completion,
}

impl ProgressType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressType::Mention => "mention",
            ProgressType::Update => "update",
            ProgressType::Milestone => "milestone",
            ProgressType::Setback => "setback",
            ProgressType::Completion => "completion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Negative => "negative",
            Sentiment::Neutral => "neutral",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub description: String,
    pub category: GoalCategory,
    pub status: GoalStatus,
    pub progress: f64,
    pub target_date: Option<String>,
    pub mention_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub goal_id: Uuid,
    pub goal_title: String,
    pub progress_type: ProgressType,
    pub sentiment: Sentiment,
}

/// Result of a detect-and-track pass over one message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GoalTrackingOutcome {
    pub new_goals: Vec<Goal>,
    pub progress_updates: Vec<ProgressUpdate>,
    pub completions: Vec<Goal>,
}

impl GoalTrackingOutcome {
    pub fn is_empty(&self) -> bool {
        self.new_goals.is_empty()
            && self.progress_updates.is_empty()
            && self.completions.is_empty()
    }
}

// ── Detection patterns ─────────────────────────────────

fn explicit_goal_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:my goal is to|my new goal is to|i've set a goal to|i have a goal to|i'm committed to)\s+(.{4,80}?)(?:[,.!?]|$)")
            .expect("explicit goal regex")
    })
}

fn implicit_goal_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:i want to|i plan to|i'm planning to|i hope to|i'm going to start|i'd like to learn|i'm trying to)\s+(.{4,80}?)(?:[,.!?]|$)")
            .expect("implicit goal regex")
    })
}

fn completion_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:i (?:finally )?(?:finished|completed|achieved|accomplished)|i'm (?:finally )?done with|i reached my goal of)\s+(.{3,80}?)(?:[,.!?]|$)")
            .expect("completion regex")
    })
}

fn target_date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bby\s+((?:january|february|march|april|may|june|july|august|september|october|november|december)(?:\s+\d{4})?|\d{4}-\d{2}-\d{2}|(?:the )?end of (?:the )?(?:year|month|summer|week))")
            .expect("target date regex")
    })
}

const CATEGORY_KEYWORDS: &[(GoalCategory, &[&str])] = &[
    (GoalCategory::Learning, &["learn", "study", "course", "language", "read", "class", "skill"]),
    (GoalCategory::Health, &["gym", "weight", "run", "running", "diet", "exercise", "fitness", "marathon", "healthy", "sleep"]),
    (GoalCategory::Career, &["job", "career", "promotion", "interview", "work", "startup", "business"]),
    (GoalCategory::Financial, &["save", "saving", "money", "debt", "invest", "budget", "salary"]),
    (GoalCategory::Creative, &["write", "writing", "novel", "paint", "draw", "music", "song", "album", "photography"]),
    (GoalCategory::Social, &["friends", "meet people", "social", "community", "volunteer", "date"]),
];

pub fn classify_category(text: &str) -> GoalCategory {
    let lower = text.to_lowercase();
    let mut best = (GoalCategory::Personal, 0usize);
    for (category, keywords) in CATEGORY_KEYWORDS {
        let hits = keywords.iter().filter(|kw| lower.contains(*kw)).count();
        if hits > best.1 {
            best = (*category, hits);
        }
    }
    best.0
}

const POSITIVE_KW: &[&str] = &["great", "well", "progress", "proud", "finally", "managed", "better", "improved", "good"];
const NEGATIVE_KW: &[&str] = &["struggling", "failed", "behind", "hard", "stuck", "worse", "gave up", "missed", "can't"];

pub fn classify_sentiment(text: &str) -> Sentiment {
    let lower = text.to_lowercase();
    let pos = POSITIVE_KW.iter().filter(|k| lower.contains(*k)).count();
    let neg = NEGATIVE_KW.iter().filter(|k| lower.contains(*k)).count();
    if pos > neg {
        Sentiment::Positive
    } else if neg > pos {
        Sentiment::Negative
    } else {
        Sentiment::Neutral
    }
}

fn classify_progress_type(text: &str, sentiment: Sentiment) -> ProgressType {
    let lower = text.to_lowercase();
    if lower.contains("milestone") || lower.contains("halfway") || lower.contains("first time") {
        return ProgressType::Milestone;
    }
    match sentiment {
        Sentiment::Negative => ProgressType::Setback,
        Sentiment::Positive => ProgressType::Update,
        Sentiment::Neutral => ProgressType::Mention,
    }
}

fn tokens(text: &str) -> HashSet<String> {
    const STOPWORDS: &[&str] = &["the", "a", "an", "to", "of", "my", "i", "is", "it", "and", "for", "in", "on", "with"];
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 1 && !STOPWORDS.contains(w))
        .map(String::from)
        .collect()
}

/// Fraction of the goal's keywords present in the message.
pub fn keyword_overlap(goal_text: &str, message: &str) -> f64 {
    let goal_tokens = tokens(goal_text);
    if goal_tokens.is_empty() {
        return 0.0;
    }
    let message_tokens = tokens(message);
    let shared = goal_tokens.intersection(&message_tokens).count();
    shared as f64 / goal_tokens.len() as f64
}

// ── Service ────────────────────────────────────────────

pub struct GoalService {
    db: SqlitePool,
}

impl GoalService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// One pass over a user message: detect new goals, match progress on
    /// active goals, and close completed ones.
    pub async fn detect_and_track(&self, user_id: Uuid, text: &str) -> Result<GoalTrackingOutcome> {
        let mut outcome = GoalTrackingOutcome::default();
        let active = self.list(user_id, Some(GoalStatus::Active)).await?;

        // Completions first so "I finished X" doesn't double as progress
        let mut completed_ids: HashSet<Uuid> = HashSet::new();
        for caps in completion_regex().captures_iter(text) {
            let Some(subject) = caps.get(1) else { continue };
            for goal in &active {
                if completed_ids.contains(&goal.id) {
                    continue;
                }
                let overlap = keyword_overlap(
                    &format!("{} {}", goal.title, goal.description),
                    subject.as_str(),
                );
                if overlap >= PROGRESS_MATCH_THRESHOLD {
                    self.complete(goal.id, text).await?;
                    completed_ids.insert(goal.id);
                    let mut done = goal.clone();
                    done.status = GoalStatus::Completed;
                    done.progress = 100.0;
                    outcome.completions.push(done);
                }
            }
        }

        // New goals
        let mut detected: Vec<(String, f32)> = Vec::new();
        for caps in explicit_goal_regex().captures_iter(text) {
            if let Some(m) = caps.get(1) {
                detected.push((m.as_str().trim().to_string(), 0.9));
            }
        }
        for caps in implicit_goal_regex().captures_iter(text) {
            if let Some(m) = caps.get(1) {
                detected.push((m.as_str().trim().to_string(), 0.6));
            }
        }
        for (title, _confidence) in detected {
            // Skip near-duplicates of goals we already track
            let duplicate = active
                .iter()
                .any(|g| keyword_overlap(&g.title, &title) >= 0.5);
            if duplicate {
                continue;
            }
            let target_date = target_date_regex()
                .captures(text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
            let goal = Goal {
                id: Uuid::new_v4(),
                user_id,
                title: title.clone(),
                description: text.to_string(),
                category: classify_category(&title),
                status: GoalStatus::Active,
                progress: 0.0,
                target_date,
                mention_count: 1,
            };
            self.insert(&goal).await?;
            outcome.new_goals.push(goal);
        }

        // Progress mentions against remaining active goals
        let sentiment = classify_sentiment(text);
        for goal in &active {
            if completed_ids.contains(&goal.id) {
                continue;
            }
            let overlap =
                keyword_overlap(&format!("{} {}", goal.title, goal.description), text);
            if overlap >= PROGRESS_MATCH_THRESHOLD {
                let progress_type = classify_progress_type(text, sentiment);
                let delta = match progress_type {
                    ProgressType::Milestone => 10.0,
                    ProgressType::Update => 5.0,
                    ProgressType::Setback => -5.0,
                    _ => 0.0,
                };
                self.log_progress(goal.id, progress_type, sentiment, delta, text)
                    .await?;
                outcome.progress_updates.push(ProgressUpdate {
                    goal_id: goal.id,
                    goal_title: goal.title.clone(),
                    progress_type,
                    sentiment,
                });
            }
        }

        Ok(outcome)
    }

    /// Create a goal directly (API surface, as opposed to detection).
    pub async fn create(
        &self,
        user_id: Uuid,
        title: &str,
        description: &str,
        category: GoalCategory,
        target_date: Option<String>,
    ) -> Result<Goal> {
        let goal = Goal {
            id: Uuid::new_v4(),
            user_id,
            title: title.to_string(),
            description: description.to_string(),
            category,
            status: GoalStatus::Active,
            progress: 0.0,
            target_date,
            mention_count: 1,
        };
        self.insert(&goal).await?;
        Ok(goal)
    }

    async fn insert(&self, goal: &Goal) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO goals \
             (id, user_id, title, description, category, status, progress, target_date, \
              mention_count, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(goal.id.to_string())
        .bind(goal.user_id.to_string())
        .bind(&goal.title)
        .bind(&goal.description)
        .bind(goal.category.as_str())
        .bind(goal.status.as_str())
        .bind(goal.progress)
        .bind(&goal.target_date)
        .bind(goal.mention_count)
        .bind(&now)
        .bind(&now)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn complete(&self, goal_id: Uuid, text: &str) -> Result<()> {
        sqlx::query(
            "UPDATE goals SET status = 'completed', progress = 100.0, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(goal_id.to_string())
        .execute(&self.db)
        .await?;
        self.log_progress(goal_id, ProgressType::Completion, Sentiment::Positive, 0.0, text)
            .await
    }

    async fn log_progress(
        &self,
        goal_id: Uuid,
        progress_type: ProgressType,
        sentiment: Sentiment,
        delta: f64,
        content: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO goal_progress \
             (goal_id, progress_type, sentiment, progress_delta, content, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(goal_id.to_string())
        .bind(progress_type.as_str())
        .bind(sentiment.as_str())
        .bind(delta)
        .bind(content)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;

        if delta != 0.0 {
            sqlx::query(
                "UPDATE goals SET progress = MAX(0.0, MIN(100.0, progress + ?)), \
                 mention_count = mention_count + 1, updated_at = ? WHERE id = ?",
            )
            .bind(delta)
            .bind(Utc::now().to_rfc3339())
            .bind(goal_id.to_string())
            .execute(&self.db)
            .await?;
        } else {
            sqlx::query(
                "UPDATE goals SET mention_count = mention_count + 1, updated_at = ? WHERE id = ?",
            )
            .bind(Utc::now().to_rfc3339())
            .bind(goal_id.to_string())
            .execute(&self.db)
            .await?;
        }
        Ok(())
    }

    pub async fn list(&self, user_id: Uuid, status: Option<GoalStatus>) -> Result<Vec<Goal>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM goals WHERE user_id = ? AND status = ? ORDER BY updated_at DESC",
                )
                .bind(user_id.to_string())
                .bind(status.as_str())
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM goals WHERE user_id = ? ORDER BY updated_at DESC")
                    .bind(user_id.to_string())
                    .fetch_all(&self.db)
                    .await?
            }
        };
        rows.iter().map(row_to_goal).collect()
    }

    pub async fn get(&self, user_id: Uuid, id: Uuid) -> Result<Option<Goal>> {
        let row = sqlx::query("SELECT * FROM goals WHERE id = ? AND user_id = ?")
            .bind(id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(&self.db)
            .await?;
        row.map(|r| row_to_goal(&r)).transpose()
    }

    pub async fn update_status(
        &self,
        user_id: Uuid,
        id: Uuid,
        status: GoalStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE goals SET status = ?, updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .bind(user_id.to_string())
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, user_id: Uuid, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM goals WHERE id = ? AND user_id = ?")
            .bind(id.to_string())
            .bind(user_id.to_string())
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_goal(row: &sqlx::sqlite::SqliteRow) -> Result<Goal> {
    let id: String = row.get("id");
    let user_id: String = row.get("user_id");
    let category: String = row.get("category");
    let status: String = row.get("status");
    Ok(Goal {
        id: Uuid::parse_str(&id)?,
        user_id: Uuid::parse_str(&user_id)?,
        title: row.get("title"),
        description: row.get("description"),
        category: GoalCategory::parse(&category).unwrap_or(GoalCategory::Personal),
        status: GoalStatus::parse(&status).unwrap_or(GoalStatus::Active),
        progress: row.get("progress"),
        target_date: row.get("target_date"),
        mention_count: row.get("mention_count"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service_with_user() -> (GoalService, Uuid) {
        let pool = crate::db::test_pool().await;
        let user_id = Uuid::new_v4();
        sqlx::query("INSERT INTO users (id, external_id, created_at) VALUES (?, ?, ?)")
            .bind(user_id.to_string())
            .bind("u1")
            .bind(Utc::now().to_rfc3339())
            .execute(&pool)
            .await
            .unwrap();
        (GoalService::new(pool), user_id)
    }

    #[test]
    fn category_classification() {
        assert_eq!(classify_category("learn spanish"), GoalCategory::Learning);
        assert_eq!(classify_category("run a marathon"), GoalCategory::Health);
        assert_eq!(classify_category("save more money"), GoalCategory::Financial);
        assert_eq!(classify_category("be a kinder person"), GoalCategory::Personal);
    }

    #[test]
    fn overlap_threshold_behaves() {
        assert!(keyword_overlap("run a marathon", "my marathon training run went well") >= 0.3);
        assert!(keyword_overlap("run a marathon", "I baked bread today") < 0.3);
    }

    #[tokio::test]
    async fn explicit_goal_is_detected_with_category_and_date() {
        let (service, user_id) = service_with_user().await;
        let outcome = service
            .detect_and_track(user_id, "My goal is to run a marathon by October.")
            .await
            .unwrap();
        assert_eq!(outcome.new_goals.len(), 1);
        let goal = &outcome.new_goals[0];
        assert_eq!(goal.category, GoalCategory::Health);
        assert_eq!(goal.target_date.as_deref(), Some("October"));
        assert_eq!(goal.status, GoalStatus::Active);
    }

    #[tokio::test]
    async fn progress_mention_is_logged_with_sentiment() {
        let (service, user_id) = service_with_user().await;
        service
            .detect_and_track(user_id, "My goal is to run a marathon.")
            .await
            .unwrap();

        let outcome = service
            .detect_and_track(user_id, "My marathon run went great this morning, good progress!")
            .await
            .unwrap();
        assert_eq!(outcome.progress_updates.len(), 1);
        assert_eq!(outcome.progress_updates[0].sentiment, Sentiment::Positive);
        assert_eq!(outcome.progress_updates[0].progress_type, ProgressType::Update);
    }

    #[tokio::test]
    async fn completion_closes_the_goal_at_100() {
        let (service, user_id) = service_with_user().await;
        service
            .detect_and_track(user_id, "My goal is to run a marathon.")
            .await
            .unwrap();

        let outcome = service
            .detect_and_track(user_id, "I finally finished the marathon!")
            .await
            .unwrap();
        assert_eq!(outcome.completions.len(), 1);

        let goals = service.list(user_id, Some(GoalStatus::Completed)).await.unwrap();
        assert_eq!(goals.len(), 1);
        assert!((goals[0].progress - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn duplicate_goals_are_not_recreated() {
        let (service, user_id) = service_with_user().await;
        service
            .detect_and_track(user_id, "I want to learn spanish.")
            .await
            .unwrap();
        let outcome = service
            .detect_and_track(user_id, "I want to learn spanish properly.")
            .await
            .unwrap();
        assert!(outcome.new_goals.is_empty());
    }
}
