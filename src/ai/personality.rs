//! Personality profiles — per-user profiles plus a read-shared registry of
//! global archetypes owned by the system user.
//!
//! Memory scoping always uses the resolved profile id, regardless of who
//! owns the profile, so conversations with distinct personalities never
//! leak memories into each other.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::db::SYSTEM_USER_ID;

/// Trait scores 0-10.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Traits {
    pub warmth: u8,
    pub humor: u8,
    pub formality: u8,
    pub curiosity: u8,
    pub empathy: u8,
    pub assertiveness: u8,
    pub playfulness: u8,
    pub patience: u8,
}

impl Default for Traits {
    fn default() -> Self {
        Self {
            warmth: 7,
            humor: 5,
            formality: 3,
            curiosity: 6,
            empathy: 7,
            assertiveness: 4,
            playfulness: 5,
            patience: 7,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Behaviors {
    pub asks_questions: bool,
    pub uses_examples: bool,
    pub admits_uncertainty: bool,
    pub offers_encouragement: bool,
    pub checks_understanding: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalityProfile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub archetype: String,
    pub traits: Traits,
    pub behaviors: Behaviors,
    pub backstory: Option<String>,
    pub custom_instructions: Option<String>,
    pub speaking_style: Option<String>,
}

impl PersonalityProfile {
    pub fn is_global(&self) -> bool {
        self.user_id.to_string() == SYSTEM_USER_ID
    }
}

/// The built-in global archetypes, seeded under the system user at startup.
pub const GLOBAL_ARCHETYPES: &[(&str, &str)] = &[
    ("companion", "A warm, attentive everyday companion."),
    ("mentor", "A patient mentor who guides with questions and examples."),
    ("coach", "An energetic coach focused on goals and accountability."),
    ("friend", "A playful, informal close friend."),
    ("analyst", "A precise, structured analytical thinker."),
];

fn traits_for_archetype(archetype: &str) -> Traits {
    match archetype {
        "mentor" => Traits { warmth: 6, humor: 3, formality: 6, curiosity: 7, empathy: 7, assertiveness: 5, playfulness: 2, patience: 9 },
        "coach" => Traits { warmth: 6, humor: 5, formality: 4, curiosity: 5, empathy: 6, assertiveness: 8, playfulness: 5, patience: 5 },
        "friend" => Traits { warmth: 9, humor: 8, formality: 1, curiosity: 6, empathy: 8, assertiveness: 3, playfulness: 9, patience: 6 },
        "analyst" => Traits { warmth: 3, humor: 2, formality: 8, curiosity: 8, empathy: 4, assertiveness: 6, playfulness: 1, patience: 7 },
        _ => Traits::default(),
    }
}

fn behaviors_for_archetype(archetype: &str) -> Behaviors {
    match archetype {
        "mentor" => Behaviors {
            asks_questions: true,
            uses_examples: true,
            admits_uncertainty: true,
            offers_encouragement: true,
            checks_understanding: true,
        },
        "coach" => Behaviors {
            asks_questions: true,
            offers_encouragement: true,
            checks_understanding: true,
            ..Default::default()
        },
        "analyst" => Behaviors {
            uses_examples: true,
            admits_uncertainty: true,
            ..Default::default()
        },
        _ => Behaviors {
            asks_questions: true,
            offers_encouragement: true,
            ..Default::default()
        },
    }
}

/// Detect a requested archetype switch from natural language, e.g.
/// "be like a mentor" or "act as my coach".
pub fn detect_archetype_change(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    let markers = ["be like a", "be like my", "act as a", "act as my", "act like a", "behave like a", "talk to me like a"];
    for (archetype, _) in GLOBAL_ARCHETYPES.iter().copied() {
        for marker in &markers {
            if lower.contains(&format!("{marker} {archetype}")) {
                return Some(archetype);
            }
        }
    }
    None
}

// ── Service ────────────────────────────────────────────

pub struct PersonalityService {
    db: SqlitePool,
}

impl PersonalityService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Seed the global archetype registry. Idempotent.
    pub async fn seed_globals(&self) -> Result<()> {
        for (name, backstory) in GLOBAL_ARCHETYPES.iter().copied() {
            let existing = sqlx::query(
                "SELECT id FROM personalities WHERE user_id = ? AND name = ?",
            )
            .bind(SYSTEM_USER_ID)
            .bind(name)
            .fetch_optional(&self.db)
            .await?;
            if existing.is_some() {
                continue;
            }

            let now = Utc::now().to_rfc3339();
            sqlx::query(
                "INSERT INTO personalities \
                 (id, user_id, name, archetype, traits, behaviors, backstory, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(SYSTEM_USER_ID)
            .bind(name)
            .bind(name)
            .bind(serde_json::to_string(&traits_for_archetype(name))?)
            .bind(serde_json::to_string(&behaviors_for_archetype(name))?)
            .bind(backstory)
            .bind(&now)
            .bind(&now)
            .execute(&self.db)
            .await?;
        }
        Ok(())
    }

    /// Resolve a profile for a turn: the user's own profile by name first,
    /// then a global archetype by name, then the default global.
    pub async fn resolve(
        &self,
        user_id: Uuid,
        name: Option<&str>,
    ) -> Result<PersonalityProfile> {
        if let Some(name) = name {
            if let Some(profile) = self.find_by_name(user_id, name).await? {
                return Ok(profile);
            }
            if let Some(profile) = self.find_global(name).await? {
                return Ok(profile);
            }
        }
        if let Some(profile) = self.find_global("companion").await? {
            return Ok(profile);
        }
        anyhow::bail!("global personality registry is not seeded")
    }

    async fn find_by_name(&self, user_id: Uuid, name: &str) -> Result<Option<PersonalityProfile>> {
        let row = sqlx::query("SELECT * FROM personalities WHERE user_id = ? AND name = ?")
            .bind(user_id.to_string())
            .bind(name)
            .fetch_optional(&self.db)
            .await?;
        row.map(|r| row_to_profile(&r)).transpose()
    }

    async fn find_global(&self, name: &str) -> Result<Option<PersonalityProfile>> {
        let row = sqlx::query("SELECT * FROM personalities WHERE user_id = ? AND name = ?")
            .bind(SYSTEM_USER_ID)
            .bind(name)
            .fetch_optional(&self.db)
            .await?;
        row.map(|r| row_to_profile(&r)).transpose()
    }

    pub async fn get(&self, user_id: Uuid, id: Uuid) -> Result<Option<PersonalityProfile>> {
        let row = sqlx::query(
            "SELECT * FROM personalities WHERE id = ? AND (user_id = ? OR user_id = ?)",
        )
        .bind(id.to_string())
        .bind(user_id.to_string())
        .bind(SYSTEM_USER_ID)
        .fetch_optional(&self.db)
        .await?;
        row.map(|r| row_to_profile(&r)).transpose()
    }

    pub async fn list(&self, user_id: Uuid) -> Result<Vec<PersonalityProfile>> {
        let rows = sqlx::query(
            "SELECT * FROM personalities WHERE user_id = ? OR user_id = ? ORDER BY name",
        )
        .bind(user_id.to_string())
        .bind(SYSTEM_USER_ID)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(row_to_profile).collect()
    }

    pub async fn create(&self, profile: &PersonalityProfile) -> Result<Uuid> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO personalities \
             (id, user_id, name, archetype, traits, behaviors, backstory, custom_instructions, \
              speaking_style, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(profile.id.to_string())
        .bind(profile.user_id.to_string())
        .bind(&profile.name)
        .bind(&profile.archetype)
        .bind(serde_json::to_string(&profile.traits)?)
        .bind(serde_json::to_string(&profile.behaviors)?)
        .bind(&profile.backstory)
        .bind(&profile.custom_instructions)
        .bind(&profile.speaking_style)
        .bind(&now)
        .bind(&now)
        .execute(&self.db)
        .await?;
        Ok(profile.id)
    }

    pub async fn update(&self, profile: &PersonalityProfile) -> Result<()> {
        sqlx::query(
            "UPDATE personalities SET name = ?, archetype = ?, traits = ?, behaviors = ?, \
             backstory = ?, custom_instructions = ?, speaking_style = ?, updated_at = ? \
             WHERE id = ? AND user_id = ?",
        )
        .bind(&profile.name)
        .bind(&profile.archetype)
        .bind(serde_json::to_string(&profile.traits)?)
        .bind(serde_json::to_string(&profile.behaviors)?)
        .bind(&profile.backstory)
        .bind(&profile.custom_instructions)
        .bind(&profile.speaking_style)
        .bind(Utc::now().to_rfc3339())
        .bind(profile.id.to_string())
        .bind(profile.user_id.to_string())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, user_id: Uuid, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM personalities WHERE id = ? AND user_id = ?")
            .bind(id.to_string())
            .bind(user_id.to_string())
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Apply a detected archetype switch to the resolved profile in one
    /// statement. Global profiles are shared and never mutated; the switch
    /// resolves the matching global archetype for the turn instead.
    pub async fn apply_archetype(
        &self,
        user_id: Uuid,
        profile: &PersonalityProfile,
        archetype: &str,
    ) -> Result<PersonalityProfile> {
        if profile.is_global() {
            return self
                .resolve(user_id, Some(archetype))
                .await;
        }
        sqlx::query(
            "UPDATE personalities SET archetype = ?, traits = ?, behaviors = ?, updated_at = ? \
             WHERE id = ? AND user_id = ?",
        )
        .bind(archetype)
        .bind(serde_json::to_string(&traits_for_archetype(archetype))?)
        .bind(serde_json::to_string(&behaviors_for_archetype(archetype))?)
        .bind(Utc::now().to_rfc3339())
        .bind(profile.id.to_string())
        .bind(user_id.to_string())
        .execute(&self.db)
        .await?;

        let mut updated = profile.clone();
        updated.archetype = archetype.to_string();
        updated.traits = traits_for_archetype(archetype);
        updated.behaviors = behaviors_for_archetype(archetype);
        Ok(updated)
    }
}

fn row_to_profile(row: &sqlx::sqlite::SqliteRow) -> Result<PersonalityProfile> {
    let id: String = row.get("id");
    let user_id: String = row.get("user_id");
    let traits: String = row.get("traits");
    let behaviors: String = row.get("behaviors");
    Ok(PersonalityProfile {
        id: Uuid::parse_str(&id)?,
        user_id: Uuid::parse_str(&user_id)?,
        name: row.get("name"),
        archetype: row.get("archetype"),
        traits: serde_json::from_str(&traits).unwrap_or_default(),
        behaviors: serde_json::from_str(&behaviors).unwrap_or_default(),
        backstory: row.get("backstory"),
        custom_instructions: row.get("custom_instructions"),
        speaking_style: row.get("speaking_style"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archetype_change_detection() {
        assert_eq!(detect_archetype_change("please be like a mentor"), Some("mentor"));
        assert_eq!(detect_archetype_change("act as my coach from now on"), Some("coach"));
        assert_eq!(detect_archetype_change("what's for dinner"), None);
    }

    #[tokio::test]
    async fn seeding_is_idempotent_and_resolution_falls_back() {
        let pool = crate::db::test_pool().await;
        let service = PersonalityService::new(pool.clone());
        service.seed_globals().await.unwrap();
        service.seed_globals().await.unwrap();

        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM personalities WHERE user_id = ?")
            .bind(SYSTEM_USER_ID)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0 as usize, GLOBAL_ARCHETYPES.len());

        let user_id = Uuid::new_v4();
        let default = service.resolve(user_id, None).await.unwrap();
        assert_eq!(default.name, "companion");
        assert!(default.is_global());

        let mentor = service.resolve(user_id, Some("mentor")).await.unwrap();
        assert_eq!(mentor.archetype, "mentor");

        // Unknown names fall back to the default companion
        let fallback = service.resolve(user_id, Some("astronaut")).await.unwrap();
        assert_eq!(fallback.name, "companion");
    }

    #[tokio::test]
    async fn user_profile_shadows_global_of_same_name() {
        let pool = crate::db::test_pool().await;
        let service = PersonalityService::new(pool.clone());
        service.seed_globals().await.unwrap();

        let user_id = Uuid::new_v4();
        sqlx::query("INSERT INTO users (id, external_id, created_at) VALUES (?, ?, ?)")
            .bind(user_id.to_string())
            .bind("u1")
            .bind(Utc::now().to_rfc3339())
            .execute(&pool)
            .await
            .unwrap();

        let custom = PersonalityProfile {
            id: Uuid::new_v4(),
            user_id,
            name: "mentor".to_string(),
            archetype: "mentor".to_string(),
            traits: Traits::default(),
            behaviors: Behaviors::default(),
            backstory: Some("my own mentor".to_string()),
            custom_instructions: None,
            speaking_style: None,
        };
        service.create(&custom).await.unwrap();

        let resolved = service.resolve(user_id, Some("mentor")).await.unwrap();
        assert_eq!(resolved.id, custom.id);
        assert!(!resolved.is_global());
    }
}
