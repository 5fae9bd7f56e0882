//! Request handlers for the HTTP adapter.

use std::convert::Infallible;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;
use warp::hyper::Body;
use warp::{Rejection, Reply};

use crate::ai::goals::GoalStatus;
use crate::ai::orchestrator::ChatTurnRequest;
use crate::ai::personality::{Behaviors, PersonalityProfile, Traits};
use crate::ai::preferences::Preferences;
use crate::api::reject;
use crate::auth::AuthedUser;
use crate::error::Error;
use crate::App;

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub message: String,
    pub conversation_id: Option<Uuid>,
    pub personality_name: Option<String>,
}

pub async fn chat(
    user: AuthedUser,
    body: ChatBody,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    let rx = app
        .orchestrator
        .chat(ChatTurnRequest {
            user,
            conversation_id: body.conversation_id,
            message: body.message,
            personality_name: body.personality_name,
        })
        .await
        .map_err(reject)?;

    let stream = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.to_line()));
    let response = warp::http::Response::builder()
        .header("content-type", "application/x-ndjson")
        .header("cache-control", "no-cache")
        .body(Body::wrap_stream(stream))
        .map_err(|e| reject(Error::Internal(e.to_string())))?;
    Ok(response)
}

// ── Auth ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateTokenBody {
    pub user_id: String,
    pub expires_in_hours: Option<i64>,
}

#[derive(Serialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    user_id: String,
}

pub async fn create_token(body: CreateTokenBody, app: Arc<App>) -> Result<impl Reply, Rejection> {
    let (access_token, expires_in) = app
        .auth
        .create_token(&body.user_id, body.expires_in_hours.unwrap_or(24))
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&TokenResponse {
        access_token,
        expires_in,
        user_id: body.user_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ValidateTokenBody {
    pub token: String,
}

#[derive(Serialize)]
struct ValidateResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn validate_token(
    body: ValidateTokenBody,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    let response = match app.auth.validate_token(&body.token) {
        Ok(claims) => ValidateResponse {
            valid: true,
            user_id: Some(claims.user_id),
            expires_at: Some(claims.exp),
            error: None,
        },
        Err(e) => ValidateResponse {
            valid: false,
            user_id: None,
            expires_at: None,
            error: Some(e.to_string()),
        },
    };
    Ok(warp::reply::json(&response))
}

// ── Conversations ──────────────────────────────────────

pub async fn list_conversations(user: AuthedUser, app: Arc<App>) -> Result<impl Reply, Rejection> {
    let conversations = app.conversations.list(user.id).await.map_err(reject)?;
    Ok(warp::reply::json(&conversations))
}

pub async fn list_messages(
    id: Uuid,
    user: AuthedUser,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    app.conversations.get_owned(user.id, id).await.map_err(reject)?;
    let messages = app.conversations.list_messages(id).await.map_err(reject)?;
    Ok(warp::reply::json(&messages))
}

pub async fn list_conversation_memories(
    id: Uuid,
    user: AuthedUser,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    app.conversations.get_owned(user.id, id).await.map_err(reject)?;
    let memories = app
        .store
        .get_by_conversation(id)
        .await
        .map_err(|e| reject(Error::Internal(e.to_string())))?;
    Ok(warp::reply::json(&memories))
}

/// Clears the short-term buffer; long-term memories are retained.
pub async fn reset_conversation(
    id: Uuid,
    user: AuthedUser,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    app.conversations.get_owned(user.id, id).await.map_err(reject)?;
    app.buffer.reset(id).await.map_err(reject)?;
    Ok(warp::reply::json(&serde_json::json!({ "reset": true })))
}

/// Removes the long-term memories extracted from this conversation.
pub async fn clear_memories(
    id: Uuid,
    user: AuthedUser,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    app.conversations.get_owned(user.id, id).await.map_err(reject)?;
    let removed = app
        .store
        .delete_by_conversation(id)
        .await
        .map_err(|e| reject(Error::Internal(e.to_string())))?;
    Ok(warp::reply::json(&serde_json::json!({ "removed": removed })))
}

#[derive(Debug, Deserialize)]
pub struct AgeVerifyBody {
    pub confirmed: bool,
}

pub async fn verify_age(
    id: Uuid,
    user: AuthedUser,
    body: AgeVerifyBody,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    app.conversations.get_owned(user.id, id).await.map_err(reject)?;
    app.sessions.set_age_verified(user.id, id, body.confirmed).await;
    Ok(warp::reply::json(
        &serde_json::json!({ "age_verified": body.confirmed }),
    ))
}

// ── Preferences ────────────────────────────────────────

pub async fn get_preferences(user: AuthedUser, app: Arc<App>) -> Result<impl Reply, Rejection> {
    let prefs = app.preferences.get(user.id).await.map_err(|e| reject(Error::Internal(e.to_string())))?;
    Ok(warp::reply::json(&prefs))
}

pub async fn set_preferences(
    user: AuthedUser,
    body: Preferences,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    body.validate().map_err(|e| reject(Error::Validation(e)))?;
    app.preferences
        .set(user.id, &body)
        .await
        .map_err(|e| reject(Error::Internal(e.to_string())))?;
    Ok(warp::reply::json(&body))
}

// ── Personalities ──────────────────────────────────────

pub async fn list_personalities(user: AuthedUser, app: Arc<App>) -> Result<impl Reply, Rejection> {
    let profiles = app
        .personalities
        .list(user.id)
        .await
        .map_err(|e| reject(Error::Internal(e.to_string())))?;
    Ok(warp::reply::json(&profiles))
}

#[derive(Debug, Deserialize)]
pub struct CreatePersonalityBody {
    pub name: String,
    pub archetype: String,
    #[serde(default)]
    pub traits: Option<Traits>,
    #[serde(default)]
    pub behaviors: Option<Behaviors>,
    pub backstory: Option<String>,
    pub custom_instructions: Option<String>,
    pub speaking_style: Option<String>,
}

pub async fn create_personality(
    user: AuthedUser,
    body: CreatePersonalityBody,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    if body.name.trim().is_empty() {
        return Err(reject(Error::Validation("name must not be empty".to_string())));
    }
    let profile = PersonalityProfile {
        id: Uuid::new_v4(),
        user_id: user.id,
        name: body.name,
        archetype: body.archetype,
        traits: body.traits.unwrap_or_default(),
        behaviors: body.behaviors.unwrap_or_default(),
        backstory: body.backstory,
        custom_instructions: body.custom_instructions,
        speaking_style: body.speaking_style,
    };
    app.personalities
        .create(&profile)
        .await
        .map_err(|e| reject(Error::Internal(e.to_string())))?;
    Ok(warp::reply::json(&profile))
}

pub async fn update_personality(
    id: Uuid,
    user: AuthedUser,
    body: CreatePersonalityBody,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    let existing = app
        .personalities
        .get(user.id, id)
        .await
        .map_err(|e| reject(Error::Internal(e.to_string())))?
        .ok_or_else(|| reject(Error::NotFound))?;
    // Global profiles are shared and read-only
    if existing.user_id != user.id {
        return Err(reject(Error::NotFound));
    }
    let profile = PersonalityProfile {
        id,
        user_id: user.id,
        name: body.name,
        archetype: body.archetype,
        traits: body.traits.unwrap_or(existing.traits),
        behaviors: body.behaviors.unwrap_or(existing.behaviors),
        backstory: body.backstory.or(existing.backstory),
        custom_instructions: body.custom_instructions.or(existing.custom_instructions),
        speaking_style: body.speaking_style.or(existing.speaking_style),
    };
    app.personalities
        .update(&profile)
        .await
        .map_err(|e| reject(Error::Internal(e.to_string())))?;
    Ok(warp::reply::json(&profile))
}

pub async fn delete_personality(
    id: Uuid,
    user: AuthedUser,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    let deleted = app
        .personalities
        .delete(user.id, id)
        .await
        .map_err(|e| reject(Error::Internal(e.to_string())))?;
    if !deleted {
        return Err(reject(Error::NotFound));
    }
    Ok(warp::reply::json(&serde_json::json!({ "deleted": true })))
}

// ── Goals ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GoalQuery {
    pub status: Option<String>,
}

pub async fn list_goals(
    user: AuthedUser,
    query: GoalQuery,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            GoalStatus::parse(s)
                .ok_or_else(|| reject(Error::Validation(format!("unknown status: {s}"))))?,
        ),
        None => None,
    };
    let goals = app
        .goals
        .list(user.id, status)
        .await
        .map_err(|e| reject(Error::Internal(e.to_string())))?;
    Ok(warp::reply::json(&goals))
}

#[derive(Debug, Deserialize)]
pub struct CreateGoalBody {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: Option<String>,
    pub target_date: Option<String>,
}

pub async fn create_goal(
    user: AuthedUser,
    body: CreateGoalBody,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    if body.title.trim().is_empty() {
        return Err(reject(Error::Validation("title must not be empty".to_string())));
    }
    let category = match body.category.as_deref() {
        Some(c) => crate::ai::goals::GoalCategory::parse(c)
            .ok_or_else(|| reject(Error::Validation(format!("unknown category: {c}"))))?,
        None => crate::ai::goals::classify_category(&body.title),
    };
    let goal = app
        .goals
        .create(user.id, &body.title, &body.description, category, body.target_date)
        .await
        .map_err(|e| reject(Error::Internal(e.to_string())))?;
    Ok(warp::reply::json(&goal))
}

#[derive(Debug, Deserialize)]
pub struct GoalStatusBody {
    pub status: String,
}

pub async fn update_goal_status(
    id: Uuid,
    user: AuthedUser,
    body: GoalStatusBody,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    let status = GoalStatus::parse(&body.status)
        .ok_or_else(|| reject(Error::Validation(format!("unknown status: {}", body.status))))?;
    let updated = app
        .goals
        .update_status(user.id, id, status)
        .await
        .map_err(|e| reject(Error::Internal(e.to_string())))?;
    if !updated {
        return Err(reject(Error::NotFound));
    }
    Ok(warp::reply::json(&serde_json::json!({ "updated": true })))
}

pub async fn delete_goal(
    id: Uuid,
    user: AuthedUser,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    let deleted = app
        .goals
        .delete(user.id, id)
        .await
        .map_err(|e| reject(Error::Internal(e.to_string())))?;
    if !deleted {
        return Err(reject(Error::NotFound));
    }
    Ok(warp::reply::json(&serde_json::json!({ "deleted": true })))
}

// ── Emotions ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub limit: Option<i64>,
    pub days: Option<i64>,
}

pub async fn emotion_history(
    user: AuthedUser,
    query: WindowQuery,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    let history = app
        .emotions
        .history(user.id, query.limit.unwrap_or(20).clamp(1, 200))
        .await
        .map_err(|e| reject(Error::Internal(e.to_string())))?;
    Ok(warp::reply::json(&history))
}

pub async fn emotion_statistics(
    user: AuthedUser,
    query: WindowQuery,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    let statistics = app
        .emotions
        .statistics(user.id, query.days.unwrap_or(7).clamp(1, 365))
        .await
        .map_err(|e| reject(Error::Internal(e.to_string())))?;
    Ok(warp::reply::json(&statistics))
}

pub async fn emotion_trend(
    user: AuthedUser,
    query: WindowQuery,
    app: Arc<App>,
) -> Result<impl Reply, Rejection> {
    let trend = app
        .emotions
        .trend(user.id, query.days.unwrap_or(7).clamp(1, 365))
        .await
        .map_err(|e| reject(Error::Internal(e.to_string())))?;
    Ok(warp::reply::json(&serde_json::json!({ "trend": trend })))
}

// ── Health ─────────────────────────────────────────────

pub async fn health(app: Arc<App>) -> Result<impl Reply, Rejection> {
    let db_ok = sqlx::query("SELECT 1").fetch_one(&app.db).await.is_ok();
    Ok(warp::reply::json(&serde_json::json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "database": db_ok,
    })))
}
