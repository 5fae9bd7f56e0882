//! Authentication — bearer tokens, API keys and the dev-only user header.
//!
//! Bearer tokens are HS256 JWTs carrying the external user id and expiry.
//! Credentials resolve to an internal user record, created on first
//! authenticated access. Resolution order: bearer token, API key, dev
//! header (only when enabled).

use anyhow::Result as AnyResult;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// External user id.
    pub user_id: String,
    /// Expiry, unix seconds.
    pub exp: i64,
    /// Issued at, unix seconds.
    pub iat: i64,
}

/// Credentials as presented by the transport layer.
#[derive(Debug, Default, Clone)]
pub struct Credentials {
    pub bearer_token: Option<String>,
    pub api_key: Option<String>,
    pub dev_user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub id: Uuid,
    pub external_id: String,
}

pub struct AuthService {
    db: SqlitePool,
    secret: String,
    allow_dev_header: bool,
}

impl AuthService {
    pub fn new(db: SqlitePool, secret: String, allow_dev_header: bool) -> Self {
        Self { db, secret, allow_dev_header }
    }

    /// Mint a bearer token for an external user id, creating the user
    /// record if absent.
    pub async fn create_token(
        &self,
        external_id: &str,
        expires_in_hours: i64,
    ) -> Result<(String, i64)> {
        if external_id.trim().is_empty() {
            return Err(Error::Validation("user_id must not be empty".to_string()));
        }
        self.get_or_create_user(external_id).await?;

        let now = Utc::now().timestamp();
        let expires_in = expires_in_hours.clamp(1, 24 * 365) * 3600;
        let claims = Claims {
            user_id: external_id.to_string(),
            exp: now + expires_in,
            iat: now,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| Error::Internal(format!("token encoding failed: {e}")))?;
        Ok((token, expires_in))
    }

    /// Decode and verify a bearer token.
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|e| Error::InvalidCredential(format!("bad token: {e}")))
    }

    /// Resolve credentials to a user, in priority order.
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<AuthedUser> {
        if let Some(token) = &credentials.bearer_token {
            let claims = self.validate_token(token)?;
            return self.get_or_create_user(&claims.user_id).await;
        }
        if let Some(key) = &credentials.api_key {
            return self.user_for_api_key(key).await;
        }
        if let Some(external_id) = &credentials.dev_user_id {
            if self.allow_dev_header {
                return self.get_or_create_user(external_id).await;
            }
            return Err(Error::InvalidCredential(
                "dev user header is disabled".to_string(),
            ));
        }
        Err(Error::AuthRequired)
    }

    pub async fn get_or_create_user(&self, external_id: &str) -> Result<AuthedUser> {
        if let Some(row) = sqlx::query("SELECT id FROM users WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&self.db)
            .await?
        {
            let id: String = row.get("id");
            return Ok(AuthedUser {
                id: Uuid::parse_str(&id).map_err(|e| Error::Internal(e.to_string()))?,
                external_id: external_id.to_string(),
            });
        }

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT OR IGNORE INTO users (id, external_id, preferences, created_at) \
             VALUES (?, ?, '{}', ?)",
        )
        .bind(id.to_string())
        .bind(external_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;

        // A concurrent insert may have won; read back the canonical row
        let row = sqlx::query("SELECT id FROM users WHERE external_id = ?")
            .bind(external_id)
            .fetch_one(&self.db)
            .await?;
        let id: String = row.get("id");
        Ok(AuthedUser {
            id: Uuid::parse_str(&id).map_err(|e| Error::Internal(e.to_string()))?,
            external_id: external_id.to_string(),
        })
    }

    async fn user_for_api_key(&self, key: &str) -> Result<AuthedUser> {
        let row = sqlx::query(
            "SELECT u.id, u.external_id FROM api_keys k JOIN users u ON u.id = k.user_id \
             WHERE k.key = ?",
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| Error::InvalidCredential("unknown API key".to_string()))?;

        let id: String = row.get("id");
        Ok(AuthedUser {
            id: Uuid::parse_str(&id).map_err(|e| Error::Internal(e.to_string()))?,
            external_id: row.get("external_id"),
        })
    }

    /// Register an API key for a user (operator tooling).
    pub async fn register_api_key(&self, external_id: &str, key: &str) -> AnyResult<()> {
        let user = self.get_or_create_user(external_id).await?;
        sqlx::query("INSERT OR REPLACE INTO api_keys (key, user_id, created_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(user.id.to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-test-secret-test-secret!";

    async fn service() -> AuthService {
        let pool = crate::db::test_pool().await;
        AuthService::new(pool, SECRET.to_string(), false)
    }

    #[tokio::test]
    async fn token_round_trip() {
        let auth = service().await;
        let (token, expires_in) = auth.create_token("alice", 24).await.unwrap();
        assert_eq!(expires_in, 24 * 3600);

        let claims = auth.validate_token(&token).unwrap();
        assert_eq!(claims.user_id, "alice");
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[tokio::test]
    async fn expired_tokens_are_rejected() {
        let auth = service().await;
        let claims = Claims {
            user_id: "alice".to_string(),
            exp: Utc::now().timestamp() - 3600,
            iat: Utc::now().timestamp() - 7200,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(matches!(
            auth.validate_token(&token),
            Err(Error::InvalidCredential(_))
        ));
    }

    #[tokio::test]
    async fn first_access_creates_the_user_once() {
        let auth = service().await;
        let first = auth.get_or_create_user("bob").await.unwrap();
        let second = auth.get_or_create_user("bob").await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn missing_credentials_require_auth() {
        let auth = service().await;
        assert!(matches!(
            auth.authenticate(&Credentials::default()).await,
            Err(Error::AuthRequired)
        ));
    }

    #[tokio::test]
    async fn dev_header_is_rejected_unless_enabled() {
        let auth = service().await;
        let creds = Credentials {
            dev_user_id: Some("dev-user".to_string()),
            ..Default::default()
        };
        assert!(auth.authenticate(&creds).await.is_err());

        let pool = crate::db::test_pool().await;
        let permissive = AuthService::new(pool, SECRET.to_string(), true);
        let user = permissive.authenticate(&creds).await.unwrap();
        assert_eq!(user.external_id, "dev-user");
    }

    #[tokio::test]
    async fn api_keys_resolve_after_registration() {
        let auth = service().await;
        auth.register_api_key("carol", "key-123").await.unwrap();
        let creds = Credentials {
            api_key: Some("key-123".to_string()),
            ..Default::default()
        };
        let user = auth.authenticate(&creds).await.unwrap();
        assert_eq!(user.external_id, "carol");

        let bad = Credentials {
            api_key: Some("nope".to_string()),
            ..Default::default()
        };
        assert!(auth.authenticate(&bad).await.is_err());
    }
}
