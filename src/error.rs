//! Service error kinds and how they surface at the API boundary.
//!
//! A conversation that the caller does not own is reported as `NotFound`,
//! never as a permission error, so probing for foreign conversation ids
//! is indistinguishable from querying ids that never existed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication required")]
    AuthRequired,

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("not found")]
    NotFound,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status the transport adapter maps this kind to when the
    /// event stream has not been opened yet.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::AuthRequired | Error::InvalidCredential(_) => 401,
            Error::NotFound => 404,
            Error::Validation(_) => 400,
            Error::RateLimited { .. } => 429,
            Error::UpstreamUnavailable(_) => 502,
            Error::Internal(_) => 500,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Error::NotFound,
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
