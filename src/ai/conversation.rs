//! Conversation and message persistence.
//!
//! Ownership is enforced here: a conversation that exists but belongs to
//! another user is reported as `NotFound`, indistinguishable from an id
//! that never existed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ConversationService {
    db: SqlitePool,
}

impl ConversationService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Create a conversation titled from the opening message.
    pub async fn create(&self, user_id: Uuid, first_message: &str) -> Result<Conversation> {
        let id = Uuid::new_v4();
        let title = derive_title(first_message);
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO conversations (id, user_id, title, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(user_id.to_string())
        .bind(&title)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.db)
        .await?;

        Ok(Conversation {
            id,
            user_id,
            title: Some(title),
            summary: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Fetch a conversation the caller owns; anything else is `NotFound`.
    pub async fn get_owned(&self, user_id: Uuid, id: Uuid) -> Result<Conversation> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ? AND user_id = ?")
            .bind(id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(&self.db)
            .await?
            .ok_or(Error::NotFound)?;
        row_to_conversation(&row)
    }

    pub async fn list(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT * FROM conversations WHERE user_id = ? ORDER BY updated_at DESC",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(row_to_conversation).collect()
    }

    /// Append a message and bump the conversation's `updated_at`.
    pub async fn append_message(
        &self,
        conversation_id: Uuid,
        role: &str,
        content: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO conversation_messages (conversation_id, role, content, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(conversation_id.to_string())
        .bind(role)
        .bind(content)
        .bind(&now)
        .execute(&self.db)
        .await?;

        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(conversation_id.to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Messages in append order.
    pub async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT role, content, created_at FROM conversation_messages \
             WHERE conversation_id = ? ORDER BY id ASC",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.db)
        .await?;
        rows.iter()
            .map(|r| {
                let created_at: String = r.get("created_at");
                Ok(StoredMessage {
                    role: r.get("role"),
                    content: r.get("content"),
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map_err(|e| Error::Internal(e.to_string()))?
                        .with_timezone(&Utc),
                })
            })
            .collect()
    }

    pub async fn set_summary(&self, conversation_id: Uuid, summary: &str) -> Result<()> {
        sqlx::query("UPDATE conversations SET summary = ?, updated_at = ? WHERE id = ?")
            .bind(summary)
            .bind(Utc::now().to_rfc3339())
            .bind(conversation_id.to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

/// First ~40 chars of the opening message, on a char boundary.
fn derive_title(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return "New conversation".to_string();
    }
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() > 40 {
        format!("{}…", chars[..40].iter().collect::<String>())
    } else {
        trimmed.to_string()
    }
}

fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation> {
    let id: String = row.get("id");
    let user_id: String = row.get("user_id");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Ok(Conversation {
        id: Uuid::parse_str(&id).map_err(|e| Error::Internal(e.to_string()))?,
        user_id: Uuid::parse_str(&user_id).map_err(|e| Error::Internal(e.to_string()))?,
        title: row.get("title"),
        summary: row.get("summary"),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| Error::Internal(e.to_string()))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| Error::Internal(e.to_string()))?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service_with_users() -> (ConversationService, Uuid, Uuid) {
        let pool = crate::db::test_pool().await;
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        for (id, ext) in [(u1, "u1"), (u2, "u2")] {
            sqlx::query("INSERT INTO users (id, external_id, created_at) VALUES (?, ?, ?)")
                .bind(id.to_string())
                .bind(ext)
                .bind(Utc::now().to_rfc3339())
                .execute(&pool)
                .await
                .unwrap();
        }
        (ConversationService::new(pool), u1, u2)
    }

    #[tokio::test]
    async fn foreign_conversations_read_as_not_found() {
        let (service, u1, u2) = service_with_users().await;
        let conversation = service.create(u1, "hello there").await.unwrap();

        assert!(service.get_owned(u1, conversation.id).await.is_ok());
        assert!(matches!(
            service.get_owned(u2, conversation.id).await,
            Err(Error::NotFound)
        ));
        assert!(matches!(
            service.get_owned(u2, Uuid::new_v4()).await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn messages_come_back_in_append_order() {
        let (service, u1, _) = service_with_users().await;
        let conversation = service.create(u1, "hi").await.unwrap();
        for i in 0..5 {
            service
                .append_message(conversation.id, "user", &format!("m{i}"))
                .await
                .unwrap();
        }
        let messages = service.list_messages(conversation.id).await.unwrap();
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn titles_derive_from_the_opening_message() {
        let (service, u1, _) = service_with_users().await;
        let short = service.create(u1, "plan my trip").await.unwrap();
        assert_eq!(short.title.as_deref(), Some("plan my trip"));

        let long = service.create(u1, &"x".repeat(100)).await.unwrap();
        assert!(long.title.unwrap().chars().count() <= 41);
    }
}
