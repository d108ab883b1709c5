//! Top-level gateway error type.
//!
//! Every subsystem error surfaces through `AppError` at the HTTP boundary:
//! the client sees only the status code and the terse message below, while
//! the full source error is logged at `error` level for `Internal`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("Unauthorized")]
    Auth,

    #[error("rate limit exceeded, try again shortly")]
    RateLimit,

    #[error("{0} is not configured")]
    NotConfigured(String),

    #[error("{0}")]
    Worker(WorkerErrorCode, String),

    #[error("not found")]
    NotFound,

    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerErrorCode {
    InvalidAudio,
    TooShort,
    TooLong,
    Internal,
}

impl WorkerErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidAudio => "invalid_audio",
            Self::TooShort => "too_short",
            Self::TooLong => "too_long",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl AppError {
    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        Self::Internal(err.into())
    }
}

impl From<ev_common::Error> for AppError {
    fn from(err: ev_common::Error) -> Self {
        match err {
            ev_common::Error::Scoring(ev_common::error::ScoringError::InvalidAudio(msg)) => {
                Self::Worker(WorkerErrorCode::InvalidAudio, msg)
            }
            ev_common::Error::Scoring(ev_common::error::ScoringError::TooShort) => {
                Self::Worker(WorkerErrorCode::TooShort, "audio too short".to_string())
            }
            ev_common::Error::Scoring(ev_common::error::ScoringError::TooLong) => {
                Self::Worker(WorkerErrorCode::TooLong, "audio too long".to_string())
            }
            ev_common::Error::Other(msg) => Self::internal(anyhow::anyhow!(msg)),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Auth => (StatusCode::UNAUTHORIZED, self.to_string()),
            Self::RateLimit => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            Self::NotConfigured(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            Self::Worker(code, msg) => {
                let status = if *code == WorkerErrorCode::Internal {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::BAD_REQUEST
                };
                let message = if *code == WorkerErrorCode::Internal {
                    "please retry".to_string()
                } else {
                    msg.clone()
                };
                (status, message)
            }
            Self::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
