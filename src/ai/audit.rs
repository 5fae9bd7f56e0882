//! Append-only audit log for classification outcomes.
//!
//! Stores the request id, user id, a SHA-256 of the normalized text (never
//! the text itself) and the per-layer results.

use anyhow::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::ai::classifier::Classification;

pub struct AuditLog {
    db: SqlitePool,
}

impl AuditLog {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn record(
        &self,
        request_id: &str,
        user_id: Uuid,
        normalized_text: &str,
        classification: &Classification,
    ) -> Result<()> {
        let layer_results = serde_json::to_string(&classification.layer_results)?;
        sqlx::query(
            "INSERT INTO classification_audit \
             (request_id, user_id, text_hash, label, confidence, layer_results, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(request_id)
        .bind(user_id.to_string())
        .bind(text_hash(normalized_text))
        .bind(classification.label.as_str())
        .bind(classification.confidence as f64)
        .bind(layer_results)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

pub fn text_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::classifier::{LayerOutcome, SafetyLabel};
    use sqlx::Row;

    #[tokio::test]
    async fn records_are_appended_with_hash_not_text() {
        let pool = crate::db::test_pool().await;
        let audit = AuditLog::new(pool.clone());
        let user_id = Uuid::new_v4();

        let classification = Classification {
            label: SafetyLabel::Safe,
            confidence: 0.95,
            reasoning: "pattern scorer".to_string(),
            layer_results: vec![LayerOutcome::Normalized { text_len: 5 }],
        };
        audit
            .record("req-1", user_id, "hello", &classification)
            .await
            .unwrap();

        let row = sqlx::query("SELECT * FROM classification_audit")
            .fetch_one(&pool)
            .await
            .unwrap();
        let hash: String = row.get("text_hash");
        assert_eq!(hash.len(), 64);
        assert_ne!(hash, "hello");
        let label: String = row.get("label");
        assert_eq!(label, "SAFE");
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(text_hash("abc"), text_hash("abc"));
        assert_ne!(text_hash("abc"), text_hash("abd"));
    }
}
