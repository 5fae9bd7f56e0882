//! HTTP adapter — warp routes over the core pipeline.
//!
//! The chat endpoint streams the turn's events as newline-delimited JSON;
//! everything else is plain JSON. The adapter only encodes; all semantics
//! live in the core.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::auth::{AuthedUser, Credentials};
use crate::error::Error;
use crate::App;

/// Core error carried through warp's rejection machinery.
#[derive(Debug)]
pub struct ApiError {
    pub status: u16,
    pub kind: String,
    pub detail: String,
    pub retry_after: Option<u64>,
}

impl warp::reject::Reject for ApiError {}

pub fn reject(error: Error) -> Rejection {
    let retry_after = match &error {
        Error::RateLimited { retry_after_secs } => Some(*retry_after_secs),
        _ => None,
    };
    let kind = match &error {
        Error::AuthRequired => "auth_required",
        Error::InvalidCredential(_) => "invalid_credential",
        Error::NotFound => "not_found",
        Error::Validation(_) => "validation_error",
        Error::UpstreamUnavailable(_) => "upstream_unavailable",
        Error::RateLimited { .. } => "rate_limited",
        Error::Internal(_) => "internal",
    };
    warp::reject::custom(ApiError {
        status: error.status_code(),
        kind: kind.to_string(),
        detail: error.to_string(),
        retry_after,
    })
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    detail: String,
}

pub async fn recover(rejection: Rejection) -> Result<impl Reply, Rejection> {
    if let Some(api_error) = rejection.find::<ApiError>() {
        let status =
            StatusCode::from_u16(api_error.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = warp::reply::json(&ErrorBody {
            error: api_error.kind.clone(),
            detail: api_error.detail.clone(),
        });
        let mut response = warp::reply::with_status(body, status).into_response();
        if let Some(retry_after) = api_error.retry_after {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        return Ok(response);
    }
    if rejection.is_not_found() {
        let body = warp::reply::json(&ErrorBody {
            error: "not_found".to_string(),
            detail: "not found".to_string(),
        });
        return Ok(warp::reply::with_status(body, StatusCode::NOT_FOUND).into_response());
    }
    if rejection.find::<warp::filters::body::BodyDeserializeError>().is_some() {
        let body = warp::reply::json(&ErrorBody {
            error: "validation_error".to_string(),
            detail: "malformed request body".to_string(),
        });
        return Ok(warp::reply::with_status(body, StatusCode::BAD_REQUEST).into_response());
    }
    Err(rejection)
}

fn with_app(app: Arc<App>) -> impl Filter<Extract = (Arc<App>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || app.clone())
}

/// Credential resolution: bearer token, API key, then the dev header.
fn authenticated(
    app: Arc<App>,
) -> impl Filter<Extract = (AuthedUser,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(warp::header::optional::<String>("x-api-key"))
        .and(warp::header::optional::<String>("x-user-id"))
        .and(with_app(app))
        .and_then(
            |authorization: Option<String>,
             api_key: Option<String>,
             dev_user_id: Option<String>,
             app: Arc<App>| async move {
                let bearer_token = authorization
                    .as_deref()
                    .and_then(|h| h.strip_prefix("Bearer "))
                    .map(str::to_string);
                let credentials = Credentials { bearer_token, api_key, dev_user_id };
                app.auth
                    .authenticate(&credentials)
                    .await
                    .map_err(reject)
            },
        )
}

pub fn routes(
    app: Arc<App>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let chat = warp::path!("chat")
        .and(warp::post())
        .and(authenticated(app.clone()))
        .and(warp::body::json())
        .and(with_app(app.clone()))
        .and_then(handlers::chat);

    let create_token = warp::path!("auth" / "token")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_app(app.clone()))
        .and_then(handlers::create_token);

    let validate_token = warp::path!("auth" / "validate")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_app(app.clone()))
        .and_then(handlers::validate_token);

    let list_conversations = warp::path!("conversations")
        .and(warp::get())
        .and(authenticated(app.clone()))
        .and(with_app(app.clone()))
        .and_then(handlers::list_conversations);

    let list_messages = warp::path!("conversations" / Uuid / "messages")
        .and(warp::get())
        .and(authenticated(app.clone()))
        .and(with_app(app.clone()))
        .and_then(handlers::list_messages);

    let list_conversation_memories = warp::path!("conversations" / Uuid / "memories")
        .and(warp::get())
        .and(authenticated(app.clone()))
        .and(with_app(app.clone()))
        .and_then(handlers::list_conversation_memories);

    let reset_conversation = warp::path!("conversations" / Uuid / "reset")
        .and(warp::post())
        .and(authenticated(app.clone()))
        .and(with_app(app.clone()))
        .and_then(handlers::reset_conversation);

    let clear_memories = warp::path!("conversations" / Uuid / "memories" / "clear")
        .and(warp::post())
        .and(authenticated(app.clone()))
        .and(with_app(app.clone()))
        .and_then(handlers::clear_memories);

    let verify_age = warp::path!("conversations" / Uuid / "verify-age")
        .and(warp::post())
        .and(authenticated(app.clone()))
        .and(warp::body::json())
        .and(with_app(app.clone()))
        .and_then(handlers::verify_age);

    let get_preferences = warp::path!("preferences")
        .and(warp::get())
        .and(authenticated(app.clone()))
        .and(with_app(app.clone()))
        .and_then(handlers::get_preferences);

    let set_preferences = warp::path!("preferences")
        .and(warp::put())
        .and(authenticated(app.clone()))
        .and(warp::body::json())
        .and(with_app(app.clone()))
        .and_then(handlers::set_preferences);

    let list_personalities = warp::path!("personalities")
        .and(warp::get())
        .and(authenticated(app.clone()))
        .and(with_app(app.clone()))
        .and_then(handlers::list_personalities);

    let create_personality = warp::path!("personalities")
        .and(warp::post())
        .and(authenticated(app.clone()))
        .and(warp::body::json())
        .and(with_app(app.clone()))
        .and_then(handlers::create_personality);

    let update_personality = warp::path!("personalities" / Uuid)
        .and(warp::put())
        .and(authenticated(app.clone()))
        .and(warp::body::json())
        .and(with_app(app.clone()))
        .and_then(handlers::update_personality);

    let delete_personality = warp::path!("personalities" / Uuid)
        .and(warp::delete())
        .and(authenticated(app.clone()))
        .and(with_app(app.clone()))
        .and_then(handlers::delete_personality);

    let list_goals = warp::path!("goals")
        .and(warp::get())
        .and(authenticated(app.clone()))
        .and(warp::query::<handlers::GoalQuery>())
        .and(with_app(app.clone()))
        .and_then(handlers::list_goals);

    let create_goal = warp::path!("goals")
        .and(warp::post())
        .and(authenticated(app.clone()))
        .and(warp::body::json())
        .and(with_app(app.clone()))
        .and_then(handlers::create_goal);

    let update_goal_status = warp::path!("goals" / Uuid / "status")
        .and(warp::patch())
        .and(authenticated(app.clone()))
        .and(warp::body::json())
        .and(with_app(app.clone()))
        .and_then(handlers::update_goal_status);

    let delete_goal = warp::path!("goals" / Uuid)
        .and(warp::delete())
        .and(authenticated(app.clone()))
        .and(with_app(app.clone()))
        .and_then(handlers::delete_goal);

    let emotion_history = warp::path!("emotions" / "history")
        .and(warp::get())
        .and(authenticated(app.clone()))
        .and(warp::query::<handlers::WindowQuery>())
        .and(with_app(app.clone()))
        .and_then(handlers::emotion_history);

    let emotion_statistics = warp::path!("emotions" / "statistics")
        .and(warp::get())
        .and(authenticated(app.clone()))
        .and(warp::query::<handlers::WindowQuery>())
        .and(with_app(app.clone()))
        .and_then(handlers::emotion_statistics);

    let emotion_trend = warp::path!("emotions" / "trend")
        .and(warp::get())
        .and(authenticated(app.clone()))
        .and(warp::query::<handlers::WindowQuery>())
        .and(with_app(app.clone()))
        .and_then(handlers::emotion_trend);

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_app(app))
        .and_then(handlers::health);

    chat.or(create_token)
        .or(validate_token)
        .or(list_conversations)
        .or(list_messages)
        .or(list_conversation_memories)
        .or(reset_conversation)
        .or(clear_memories)
        .or(verify_age)
        .or(get_preferences)
        .or(set_preferences)
        .or(list_personalities)
        .or(create_personality)
        .or(update_personality)
        .or(delete_personality)
        .or(list_goals)
        .or(create_goal)
        .or(update_goal_status)
        .or(delete_goal)
        .or(emotion_history)
        .or(emotion_statistics)
        .or(emotion_trend)
        .or(health)
        .recover(recover)
}

pub async fn serve(app: Arc<App>) -> anyhow::Result<()> {
    let addr: SocketAddr = app.config.bind_addr.parse()?;
    let origins: Vec<String> = app
        .config
        .allowed_origins
        .split(',')
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty())
        .collect();
    let cors = warp::cors()
        .allow_origins(origins.iter().map(String::as_str))
        .allow_headers(["authorization", "content-type", "x-api-key", "x-user-id"])
        .allow_methods(["GET", "POST", "PUT", "PATCH", "DELETE"]);

    tracing::info!("listening on {addr}");
    warp::serve(routes(app).with(cors)).run(addr).await;
    Ok(())
}
