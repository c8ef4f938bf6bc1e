use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::*;
use thiserror::Error;

use crate::response::Envelope;
use crate::storage::StorageError;

/// User-visible request errors. Each variant maps to a stable machine
/// readable `code` in the response envelope; internals never leak.
#[derive(Debug, Error)]
pub enum AuthError {
  #[error("Unauthorized")]
  Unauthorized,
  #[error("Token expired")]
  TokenExpired,
  #[error("Forbidden")]
  Forbidden,
  #[error("Conflict")]
  Conflict,
  #[error("Too many requests")]
  TooManyRequests,
  #[error("Not found")]
  NotFound,
  #[error("Unsupported media type")]
  UnsupportedMediaType,
  #[error("Bad request: {0}")]
  BadRequest(&'static str),
  #[error("Internal: {0}")]
  Internal(Box<dyn std::error::Error + Send + Sync>),
}

impl From<StorageError> for AuthError {
  fn from(err: StorageError) -> Self {
    return match err {
      // Cooldown/dedup collisions surface as HTTP 409.
      StorageError::ConstraintUnique => Self::Conflict,
      StorageError::NotFound => Self::NotFound,
      StorageError::Invalid(msg) => Self::BadRequest(msg),
      err => Self::Internal(err.into()),
    };
  }
}

impl IntoResponse for AuthError {
  fn into_response(self) -> Response {
    let (status, code, message) = match &self {
      Self::Unauthorized => (
        StatusCode::UNAUTHORIZED,
        "invalid_credentials",
        "invalid credentials".to_string(),
      ),
      Self::TokenExpired => (
        StatusCode::UNAUTHORIZED,
        "token_expired",
        "token expired".to_string(),
      ),
      Self::Forbidden => (StatusCode::FORBIDDEN, "forbidden", "forbidden".to_string()),
      Self::Conflict => (
        StatusCode::CONFLICT,
        "conflict",
        "already requested".to_string(),
      ),
      Self::TooManyRequests => (
        StatusCode::TOO_MANY_REQUESTS,
        "too_many_requests",
        "too many requests".to_string(),
      ),
      Self::NotFound => (StatusCode::NOT_FOUND, "not_found", "not found".to_string()),
      Self::UnsupportedMediaType => (
        StatusCode::UNSUPPORTED_MEDIA_TYPE,
        "unsupported_media_type",
        "unsupported media type".to_string(),
      ),
      Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.to_string()),
      Self::Internal(err) => {
        error!("Internal error: {err}");
        (
          StatusCode::INTERNAL_SERVER_ERROR,
          "internal",
          "internal error".to_string(),
        )
      }
    };

    return Envelope::error(status, code, message).into_response();
  }
}
