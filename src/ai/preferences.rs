//! Communication preferences — six recognized dimensions, extracted from
//! user messages with a deterministic pattern pass and merged into the
//! stored JSON object (null means "no change").

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

pub const LANGUAGES: &[&str] = &["English", "Spanish", "French", "German", "Italian", "Portuguese"];
pub const FORMALITY: &[&str] = &["casual", "formal", "professional"];
pub const TONES: &[&str] = &["enthusiastic", "calm", "friendly", "neutral"];
pub const RESPONSE_LENGTHS: &[&str] = &["brief", "detailed", "balanced"];
pub const EXPLANATION_STYLES: &[&str] = &["simple", "technical", "analogies"];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Preferences {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emoji_usage: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_length: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation_style: Option<String>,
}

impl Preferences {
    pub fn is_empty(&self) -> bool {
        self.language.is_none()
            && self.formality.is_none()
            && self.tone.is_none()
            && self.emoji_usage.is_none()
            && self.response_length.is_none()
            && self.explanation_style.is_none()
    }

    /// Overlay non-null fields of `update` onto `self`.
    pub fn merge(&mut self, update: &Preferences) -> bool {
        let mut changed = false;
        macro_rules! overlay {
            ($field:ident) => {
                if let Some(v) = &update.$field {
                    if self.$field.as_ref() != Some(v) {
                        self.$field = Some(v.clone());
                        changed = true;
                    }
                }
            };
        }
        overlay!(language);
        overlay!(formality);
        overlay!(tone);
        overlay!(response_length);
        overlay!(explanation_style);
        if let Some(v) = update.emoji_usage {
            if self.emoji_usage != Some(v) {
                self.emoji_usage = Some(v);
                changed = true;
            }
        }
        changed
    }

    /// Reject unknown values on any dimension.
    pub fn validate(&self) -> std::result::Result<(), String> {
        fn check(dim: &str, value: &Option<String>, allowed: &[&str]) -> Result<(), String> {
            match value {
                Some(v) if !allowed.contains(&v.as_str()) => {
                    Err(format!("unknown {dim} value: {v}"))
                }
                _ => Ok(()),
            }
        }
        check("language", &self.language, LANGUAGES)?;
        check("formality", &self.formality, FORMALITY)?;
        check("tone", &self.tone, TONES)?;
        check("response_length", &self.response_length, RESPONSE_LENGTHS)?;
        check("explanation_style", &self.explanation_style, EXPLANATION_STYLES)?;
        Ok(())
    }
}

// ── Pattern extraction ─────────────────────────────────

/// Deterministic pattern pass over a user message. Unmatched dimensions
/// stay `None`.
pub fn extract(text: &str) -> Preferences {
    let lower = text.to_lowercase();
    let mut prefs = Preferences::default();

    for lang in LANGUAGES {
        let lang_lower = lang.to_lowercase();
        if lower.contains(&format!("in {lang_lower}"))
            && (lower.contains("speak")
                || lower.contains("respond")
                || lower.contains("reply")
                || lower.contains("answer")
                || lower.contains("talk")
                || lower.contains("write"))
        {
            prefs.language = Some(lang.to_string());
            break;
        }
    }

    if lower.contains("be professional") || lower.contains("professional tone") {
        prefs.formality = Some("professional".to_string());
    } else if lower.contains("be formal") || lower.contains("formally") {
        prefs.formality = Some("formal".to_string());
    } else if lower.contains("be casual") || lower.contains("keep it casual") || lower.contains("informal") {
        prefs.formality = Some("casual".to_string());
    }

    if lower.contains("be enthusiastic") || lower.contains("more enthusiasm") {
        prefs.tone = Some("enthusiastic".to_string());
    } else if lower.contains("calm tone") || lower.contains("be calm") || lower.contains("calm down") {
        prefs.tone = Some("calm".to_string());
    } else if lower.contains("be friendly") || lower.contains("friendlier") {
        prefs.tone = Some("friendly".to_string());
    } else if lower.contains("neutral tone") {
        prefs.tone = Some("neutral".to_string());
    }

    if lower.contains("no emoji")
        || lower.contains("without emoji")
        || lower.contains("stop using emoji")
        || lower.contains("don't use emoji")
    {
        prefs.emoji_usage = Some(false);
    } else if lower.contains("use emoji") || lower.contains("more emoji") || lower.contains("with emoji") {
        prefs.emoji_usage = Some(true);
    }

    if lower.contains("keep it brief")
        || lower.contains("keep it short")
        || lower.contains("be brief")
        || lower.contains("be concise")
        || lower.contains("short answers")
        || lower.contains("shorter answers")
    {
        prefs.response_length = Some("brief".to_string());
    } else if lower.contains("be detailed")
        || lower.contains("more detail")
        || lower.contains("in depth")
        || lower.contains("longer answers")
    {
        prefs.response_length = Some("detailed".to_string());
    }

    if lower.contains("explain simply")
        || lower.contains("simple terms")
        || lower.contains("like i'm five")
        || lower.contains("keep it simple")
    {
        prefs.explanation_style = Some("simple".to_string());
    } else if lower.contains("technical detail") || lower.contains("be technical") {
        prefs.explanation_style = Some("technical".to_string());
    } else if lower.contains("use analogies") || lower.contains("with analogies") {
        prefs.explanation_style = Some("analogies".to_string());
    }

    prefs
}

// ── Persistence ────────────────────────────────────────

pub struct PreferenceService {
    db: SqlitePool,
}

impl PreferenceService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn get(&self, user_id: Uuid) -> Result<Preferences> {
        let row = sqlx::query("SELECT preferences FROM users WHERE id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.db)
            .await?;
        Ok(row
            .map(|r| {
                let raw: String = r.get("preferences");
                serde_json::from_str(&raw).unwrap_or_default()
            })
            .unwrap_or_default())
    }

    pub async fn set(&self, user_id: Uuid, prefs: &Preferences) -> Result<()> {
        sqlx::query("UPDATE users SET preferences = ? WHERE id = ?")
            .bind(serde_json::to_string(prefs)?)
            .bind(user_id.to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Extract preference signals from `text` and merge them in. Returns
    /// the effective preferences and whether anything changed.
    pub async fn extract_and_update(
        &self,
        user_id: Uuid,
        text: &str,
    ) -> Result<(Preferences, bool)> {
        let update = extract(text);
        let mut stored = self.get(user_id).await?;
        if update.is_empty() {
            return Ok((stored, false));
        }
        let changed = stored.merge(&update);
        if changed {
            self.set(user_id, &stored).await?;
        }
        Ok((stored, changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_language_and_length() {
        let prefs = extract("Please respond only in Spanish, and keep it brief.");
        assert_eq!(prefs.language.as_deref(), Some("Spanish"));
        assert_eq!(prefs.response_length.as_deref(), Some("brief"));
        assert!(prefs.tone.is_none());
    }

    #[test]
    fn extracts_emoji_opt_out() {
        let prefs = extract("don't use emoji with me");
        assert_eq!(prefs.emoji_usage, Some(false));
    }

    #[test]
    fn plain_chat_extracts_nothing() {
        assert!(extract("I had a great day at work today!").is_empty());
    }

    #[test]
    fn extraction_is_deterministic() {
        let a = extract("be formal and be technical please");
        let b = extract("be formal and be technical please");
        assert_eq!(a, b);
        assert_eq!(a.formality.as_deref(), Some("formal"));
        assert_eq!(a.explanation_style.as_deref(), Some("technical"));
    }

    #[test]
    fn merge_keeps_unset_dimensions() {
        let mut stored = Preferences {
            language: Some("French".to_string()),
            ..Default::default()
        };
        let update = Preferences {
            response_length: Some("brief".to_string()),
            ..Default::default()
        };
        assert!(stored.merge(&update));
        assert_eq!(stored.language.as_deref(), Some("French"));
        assert_eq!(stored.response_length.as_deref(), Some("brief"));
    }

    #[test]
    fn validate_rejects_unknown_values() {
        let prefs = Preferences {
            tone: Some("sarcastic".to_string()),
            ..Default::default()
        };
        assert!(prefs.validate().is_err());
        assert!(Preferences::default().validate().is_ok());
    }

    #[tokio::test]
    async fn updates_persist_across_reads() {
        let pool = crate::db::test_pool().await;
        let user_id = Uuid::new_v4();
        sqlx::query("INSERT INTO users (id, external_id, created_at) VALUES (?, ?, ?)")
            .bind(user_id.to_string())
            .bind("u1")
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&pool)
            .await
            .unwrap();

        let service = PreferenceService::new(pool);
        let (_, changed) = service
            .extract_and_update(user_id, "respond in German, keep it brief")
            .await
            .unwrap();
        assert!(changed);

        let stored = service.get(user_id).await.unwrap();
        assert_eq!(stored.language.as_deref(), Some("German"));
        assert_eq!(stored.response_length.as_deref(), Some("brief"));

        // Same message again: no change
        let (_, changed) = service
            .extract_and_update(user_id, "respond in German, keep it brief")
            .await
            .unwrap();
        assert!(!changed);
    }
}
