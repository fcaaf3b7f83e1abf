//! Crate-wide error types: an internal domain error (`CoreError`) used with `?`
//! throughout engine/store/queue code, and a thin Rocket-facing wrapper
//! (`ApiError`) that never leaks raw error text to clients.

use chrono::Utc;
use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::{Request, Response};
use serde::Serialize;
use std::io::Cursor;
use thiserror::Error;
use uuid::Uuid;

use crate::provider::ProviderError;

/// Internal domain error. Propagated with `?` across the sync engine, modifier
/// queue, stores and caches. Never serialized directly to a client.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("coordination store error: {0}")]
    Coordination(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        CoreError::Coordination(err.to_string())
    }
}

impl From<mongodb::error::Error> for CoreError {
    fn from(err: mongodb::error::Error) -> Self {
        CoreError::Internal(format!("body store error: {err}"))
    }
}

/// The wire shape from the error-handling contract: `{success:false, error:{code,message},
/// request_id, timestamp}`. `code` is a short machine-readable slug; `message` is safe to show.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorBody,
    pub request_id: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Rocket-facing error. Constructed from a `CoreError` (or directly for
/// request-parsing failures) at the route boundary.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Internal(CoreError),
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(msg) => ApiError::NotFound(msg),
            CoreError::Conflict(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("resource not found".to_string()),
            other => ApiError::Internal(CoreError::Database(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_and_conflict_core_errors_map_to_client_facing_variants() {
        assert!(matches!(
            ApiError::from(CoreError::NotFound("x".to_string())),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(CoreError::Conflict("x".to_string())),
            ApiError::BadRequest(_)
        ));
    }

    #[test]
    fn other_core_errors_map_to_internal() {
        assert!(matches!(
            ApiError::from(CoreError::Internal("boom".to_string())),
            ApiError::Internal(_)
        ));
    }

    #[test]
    fn row_not_found_sqlx_error_maps_to_not_found() {
        assert!(matches!(ApiError::from(sqlx::Error::RowNotFound), ApiError::NotFound(_)));
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => {
                log::debug!("not found: {msg}");
                (Status::NotFound, "not_found", msg)
            }
            ApiError::BadRequest(msg) => {
                log::debug!("bad request: {msg}");
                (Status::BadRequest, "bad_request", msg)
            }
            ApiError::Unauthorized(msg) => {
                log::debug!("unauthorized: {msg}");
                (Status::Unauthorized, "unauthorized", msg)
            }
            ApiError::Forbidden(msg) => {
                log::debug!("forbidden: {msg}");
                (Status::Forbidden, "forbidden", msg)
            }
            ApiError::Internal(err) => {
                log::error!("internal error: {err}");
                (
                    Status::InternalServerError,
                    "internal_error",
                    "an internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code: code.to_string(),
                message,
            },
            request_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        };

        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"success":false,"error":{"code":"internal_error","message":"failed to serialize error"}}"#
                .to_string()
        });

        Response::build()
            .status(status)
            .header(rocket::http::ContentType::JSON)
            .sized_body(json.len(), Cursor::new(json))
            .ok()
    }
}
