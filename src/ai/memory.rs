//! Long-term memory store — typed, embedded, user-scoped facts with
//! importance, decay and consolidation lineage.
//!
//! Embeddings are stored as bincode BLOBs and compared with in-process
//! cosine similarity; the store returns raw similarities and leaves the
//! combined retrieval ranking to the orchestrator.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Minimum decay factor — old memories stay faintly retrievable.
const DECAY_FLOOR: f64 = 0.05;

// ── Categories ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    PersonalFact,
    Preference,
    Goal,
    Event,
    Relationship,
    Challenge,
    Achievement,
    Knowledge,
    Instruction,
    Fact,
    Context,
}

impl MemoryCategory {
    pub const ALL: [MemoryCategory; 11] = [
        MemoryCategory::PersonalFact,
        MemoryCategory::Preference,
        MemoryCategory::Goal,
        MemoryCategory::Event,
        MemoryCategory::Relationship,
        MemoryCategory::Challenge,
        MemoryCategory::Achievement,
        MemoryCategory::Knowledge,
        MemoryCategory::Instruction,
        MemoryCategory::Fact,
        MemoryCategory::Context,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::PersonalFact => "personal_fact",
            MemoryCategory::Preference => "preference",
            MemoryCategory::Goal => "goal",
            MemoryCategory::Event => "event",
            MemoryCategory::Relationship => "relationship",
            MemoryCategory::Challenge => "challenge",
            MemoryCategory::Achievement => "achievement",
            MemoryCategory::Knowledge => "knowledge",
            MemoryCategory::Instruction => "instruction",
            MemoryCategory::Fact => "fact",
            MemoryCategory::Context => "context",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == s)
    }
}

// ── Importance ─────────────────────────────────────────

/// Six weighted sub-scores, each in [0, 1]. The aggregate is the weighted
/// sum with weights totalling 1.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImportanceScores {
    pub emotional_significance: f64,
    pub explicit_mention: f64,
    pub frequency: f64,
    pub recency: f64,
    pub specificity: f64,
    pub personal_relevance: f64,
}

pub const IMPORTANCE_WEIGHTS: [(f64, &str); 6] = [
    (0.30, "emotional_significance"),
    (0.25, "explicit_mention"),
    (0.15, "frequency"),
    (0.10, "recency"),
    (0.10, "specificity"),
    (0.10, "personal_relevance"),
];

impl ImportanceScores {
    pub fn aggregate(&self) -> f64 {
        let sum = 0.30 * self.emotional_significance
            + 0.25 * self.explicit_mention
            + 0.15 * self.frequency
            + 0.10 * self.recency
            + 0.10 * self.specificity
            + 0.10 * self.personal_relevance;
        sum.clamp(0.0, 1.0)
    }

    pub fn uniform(value: f64) -> Self {
        let v = value.clamp(0.0, 1.0);
        Self {
            emotional_significance: v,
            explicit_mention: v,
            frequency: v,
            recency: v,
            specificity: v,
            personal_relevance: v,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelatedEntities {
    pub people: Vec<String>,
    pub places: Vec<String>,
    pub topics: Vec<String>,
    pub dates: Vec<String>,
}

impl RelatedEntities {
    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
            && self.places.is_empty()
            && self.topics.is_empty()
            && self.dates.is_empty()
    }

    /// Union with another entity set, deduplicating.
    pub fn merge(&mut self, other: &RelatedEntities) {
        for (mine, theirs) in [
            (&mut self.people, &other.people),
            (&mut self.places, &other.places),
            (&mut self.topics, &other.topics),
            (&mut self.dates, &other.dates),
        ] {
            for item in theirs {
                if !mine.contains(item) {
                    mine.push(item.clone());
                }
            }
        }
    }
}

// ── Memory record ──────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Memory {
    pub id: Uuid,
    pub user_id: Uuid,
    pub personality_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub content: String,
    #[serde(skip_serializing)]
    pub embedding: Vec<f32>,
    pub category: MemoryCategory,
    pub importance_scores: ImportanceScores,
    pub importance: f64,
    pub related_entities: RelatedEntities,
    pub access_count: i64,
    pub decay_factor: f64,
    pub is_active: bool,
    pub consolidated_from: Vec<Uuid>,
    pub superseded_by: Option<Uuid>,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_accessed: i64,
}

impl Memory {
    pub fn new(
        user_id: Uuid,
        personality_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
        content: String,
        embedding: Vec<f32>,
        category: MemoryCategory,
        importance_scores: ImportanceScores,
        related_entities: RelatedEntities,
    ) -> Self {
        let now = Utc::now().timestamp();
        let importance = importance_scores.aggregate();
        Self {
            id: Uuid::new_v4(),
            user_id,
            personality_id,
            conversation_id,
            content,
            embedding,
            category,
            importance_scores,
            importance,
            related_entities,
            access_count: 0,
            decay_factor: 1.0,
            is_active: true,
            consolidated_from: Vec::new(),
            superseded_by: None,
            created_at: now,
            updated_at: now,
            last_accessed: now,
        }
    }
}

/// Optional narrowing filters for similarity search.
#[derive(Debug, Clone)]
pub struct SearchFilters {
    pub categories: Option<Vec<MemoryCategory>>,
    pub min_importance: Option<f64>,
    pub active_only: bool,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            categories: None,
            min_importance: None,
            active_only: true,
        }
    }
}

// ── Store ──────────────────────────────────────────────

pub struct MemoryStore {
    db: SqlitePool,
    dim: usize,
    half_life_days: f64,
}

impl MemoryStore {
    pub fn new(db: SqlitePool, dim: usize, half_life_days: f64) -> Self {
        Self { db, dim, half_life_days }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Persist a memory. Rejects embeddings whose dimension differs from D.
    pub async fn store(&self, memory: &Memory) -> Result<Uuid> {
        if memory.embedding.len() != self.dim {
            anyhow::bail!(
                "embedding dimension mismatch: got {}, expected {}",
                memory.embedding.len(),
                self.dim
            );
        }

        let embedding_bytes = bincode::serialize(&memory.embedding)?;
        sqlx::query(
            "INSERT INTO memories (id, user_id, personality_id, conversation_id, content, \
             embedding, category, importance, importance_scores, related_entities, access_count, \
             decay_factor, is_active, consolidated_from, superseded_by, created_at, updated_at, \
             last_accessed) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(memory.id.to_string())
        .bind(memory.user_id.to_string())
        .bind(memory.personality_id.map(|p| p.to_string()))
        .bind(memory.conversation_id.map(|c| c.to_string()))
        .bind(&memory.content)
        .bind(embedding_bytes)
        .bind(memory.category.as_str())
        .bind(memory.importance)
        .bind(serde_json::to_string(&memory.importance_scores)?)
        .bind(serde_json::to_string(&memory.related_entities)?)
        .bind(memory.access_count)
        .bind(memory.decay_factor)
        .bind(memory.is_active)
        .bind(serde_json::to_string(&memory.consolidated_from)?)
        .bind(memory.superseded_by.map(|s| s.to_string()))
        .bind(memory.created_at)
        .bind(memory.updated_at)
        .bind(memory.last_accessed)
        .execute(&self.db)
        .await?;

        Ok(memory.id)
    }

    /// Cosine similarity search scoped by user and, when given, personality.
    /// Returns (memory, raw similarity) pairs above `min_similarity`,
    /// best-first, at most `k`.
    pub async fn search_similar(
        &self,
        user_id: Uuid,
        personality_id: Option<Uuid>,
        query: &[f32],
        k: usize,
        min_similarity: f32,
        filters: &SearchFilters,
    ) -> Result<Vec<(Memory, f32)>> {
        let rows = match personality_id {
            Some(pid) => {
                sqlx::query(
                    "SELECT * FROM memories WHERE user_id = ? AND personality_id = ?",
                )
                .bind(user_id.to_string())
                .bind(pid.to_string())
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM memories WHERE user_id = ?")
                    .bind(user_id.to_string())
                    .fetch_all(&self.db)
                    .await?
            }
        };

        let mut scored: Vec<(Memory, f32)> = Vec::new();
        for row in rows {
            let memory = row_to_memory(&row)?;
            if filters.active_only && !memory.is_active {
                continue;
            }
            if let Some(min_imp) = filters.min_importance {
                if memory.importance < min_imp {
                    continue;
                }
            }
            if let Some(cats) = &filters.categories {
                if !cats.contains(&memory.category) {
                    continue;
                }
            }

            let similarity = cosine_similarity(query, &memory.embedding);
            if similarity >= min_similarity {
                scored.push((memory, similarity));
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Memory>> {
        let row = sqlx::query("SELECT * FROM memories WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.db)
            .await?;
        row.map(|r| row_to_memory(&r)).transpose()
    }

    /// Record an access: bump the counter, refresh `last_accessed`, and
    /// recompute the decay factor from age and the configured half-life.
    /// Importance is rescored when the access count or age crosses a
    /// threshold, since the recency axis drifts as the memory ages.
    pub async fn update_access(&self, id: Uuid) -> Result<()> {
        let Some(memory) = self.get(id).await? else {
            return Ok(());
        };
        let now = Utc::now().timestamp();
        let decay = self.decay_for_age(now - memory.created_at);

        sqlx::query(
            "UPDATE memories SET access_count = access_count + 1, last_accessed = ?, \
             decay_factor = ? WHERE id = ?",
        )
        .bind(now)
        .bind(decay)
        .bind(id.to_string())
        .execute(&self.db)
        .await?;

        let age_days = (now - memory.created_at).max(0) as f64 / 86_400.0;
        let last_scored_age_days = (memory.updated_at - memory.created_at).max(0) as f64 / 86_400.0;
        if crate::ai::importance::should_recompute(
            memory.access_count + 1,
            age_days,
            last_scored_age_days,
        ) {
            let mut scores = memory.importance_scores.clone();
            scores.recency = 1.0 / (1.0 + age_days / 30.0);
            sqlx::query(
                "UPDATE memories SET importance = ?, importance_scores = ?, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(scores.aggregate())
            .bind(serde_json::to_string(&scores)?)
            .bind(now)
            .bind(id.to_string())
            .execute(&self.db)
            .await?;
        }
        Ok(())
    }

    /// `0.5 ^ (age_days / half_life)` clamped to [0.05, 1.0].
    pub fn decay_for_age(&self, age_secs: i64) -> f64 {
        let age_days = age_secs.max(0) as f64 / 86_400.0;
        (0.5f64)
            .powf(age_days / self.half_life_days)
            .clamp(DECAY_FLOOR, 1.0)
    }

    /// Replace content, embedding, scores, entities and lineage fields.
    pub async fn update(&self, memory: &Memory) -> Result<()> {
        if memory.embedding.len() != self.dim {
            anyhow::bail!(
                "embedding dimension mismatch: got {}, expected {}",
                memory.embedding.len(),
                self.dim
            );
        }
        let embedding_bytes = bincode::serialize(&memory.embedding)?;
        sqlx::query(
            "UPDATE memories SET content = ?, embedding = ?, category = ?, importance = ?, \
             importance_scores = ?, related_entities = ?, decay_factor = ?, is_active = ?, \
             consolidated_from = ?, superseded_by = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&memory.content)
        .bind(embedding_bytes)
        .bind(memory.category.as_str())
        .bind(memory.importance)
        .bind(serde_json::to_string(&memory.importance_scores)?)
        .bind(serde_json::to_string(&memory.related_entities)?)
        .bind(memory.decay_factor)
        .bind(memory.is_active)
        .bind(serde_json::to_string(&memory.consolidated_from)?)
        .bind(memory.superseded_by.map(|s| s.to_string()))
        .bind(Utc::now().timestamp())
        .bind(memory.id.to_string())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn deactivate(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE memories SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(id.to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Mark `old_id` as superseded by `new_id`. Superseded memories are
    /// never reactivated.
    pub async fn supersede(&self, old_id: Uuid, new_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE memories SET superseded_by = ?, is_active = 0, updated_at = ? WHERE id = ?",
        )
        .bind(new_id.to_string())
        .bind(Utc::now().timestamp())
        .bind(old_id.to_string())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM memories WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn get_by_conversation(&self, conversation_id: Uuid) -> Result<Vec<Memory>> {
        let rows = sqlx::query(
            "SELECT * FROM memories WHERE conversation_id = ? ORDER BY created_at DESC",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(row_to_memory).collect()
    }

    pub async fn get_by_user_and_personality(
        &self,
        user_id: Uuid,
        personality_id: Option<Uuid>,
        active_only: bool,
    ) -> Result<Vec<Memory>> {
        let rows = match personality_id {
            Some(pid) => {
                sqlx::query(
                    "SELECT * FROM memories WHERE user_id = ? AND personality_id = ? \
                     ORDER BY created_at DESC",
                )
                .bind(user_id.to_string())
                .bind(pid.to_string())
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM memories WHERE user_id = ? ORDER BY created_at DESC")
                    .bind(user_id.to_string())
                    .fetch_all(&self.db)
                    .await?
            }
        };
        let mut memories: Vec<Memory> = rows
            .iter()
            .map(row_to_memory)
            .collect::<Result<Vec<_>>>()?;
        if active_only {
            memories.retain(|m| m.is_active);
        }
        Ok(memories)
    }

    pub async fn delete_by_conversation(&self, conversation_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM memories WHERE conversation_id = ?")
            .bind(conversation_id.to_string())
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self, user_id: Uuid) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM memories WHERE user_id = ? AND is_active = 1")
                .bind(user_id.to_string())
                .fetch_one(&self.db)
                .await?;
        Ok(row.0)
    }

    /// Active memory contents for a scope, newest first, paginated.
    pub async fn list(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Memory>> {
        let rows = sqlx::query(
            "SELECT * FROM memories WHERE user_id = ? AND is_active = 1 \
             ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(row_to_memory).collect()
    }
}

// ── Row mapping ────────────────────────────────────────

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| anyhow::anyhow!("bad uuid in memories table: {e}"))
}

fn row_to_memory(row: &sqlx::sqlite::SqliteRow) -> Result<Memory> {
    let embedding_bytes: Vec<u8> = row.get("embedding");
    let embedding: Vec<f32> = bincode::deserialize(&embedding_bytes)?;

    let category_str: String = row.get("category");
    let category = MemoryCategory::parse(&category_str)
        .ok_or_else(|| anyhow::anyhow!("unknown memory category: {category_str}"))?;

    let personality_id: Option<String> = row.get("personality_id");
    let conversation_id: Option<String> = row.get("conversation_id");
    let superseded_by: Option<String> = row.get("superseded_by");
    let consolidated_from: Option<String> = row.get("consolidated_from");

    let id: String = row.get("id");
    let user_id: String = row.get("user_id");
    let importance_scores: String = row.get("importance_scores");
    let related_entities: String = row.get("related_entities");

    Ok(Memory {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        personality_id: personality_id.as_deref().map(parse_uuid).transpose()?,
        conversation_id: conversation_id.as_deref().map(parse_uuid).transpose()?,
        content: row.get("content"),
        embedding,
        category,
        importance_scores: serde_json::from_str(&importance_scores).unwrap_or_default(),
        importance: row.get("importance"),
        related_entities: serde_json::from_str(&related_entities).unwrap_or_default(),
        access_count: row.get("access_count"),
        decay_factor: row.get("decay_factor"),
        is_active: row.get("is_active"),
        consolidated_from: consolidated_from
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default(),
        superseded_by: superseded_by.as_deref().map(parse_uuid).transpose()?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        last_accessed: row.get("last_accessed"),
    })
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot_product: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}
