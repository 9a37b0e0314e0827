// crates/contextcache/src/error.rs
// Standardized error types for ContextCache

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use contextcache_types::ApiError;
use thiserror::Error;

/// Main error type for the ContextCache library.
///
/// Variants map 1:1 onto the error taxonomy (kinds, not exception types):
/// Validation, Auth, GateRefused, NotFound, Conflict, StoreUnavailable,
/// Internal. `Upstream` (embedding provider failures) is deliberately absent
/// here — it is handled by falling back to the local deterministic backend
/// and never surfaces as an error to callers.
#[derive(Error, Debug)]
pub enum ContextCacheError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("authentication required")]
    Unauthenticated,

    #[error("cross-tenant access denied")]
    CrossTenant,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("content_hash collision")]
    Conflict { existing_id: i64 },

    #[error("{reason}")]
    GateRefused {
        reason: String,
        retry_after_seconds: Option<i64>,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ContextCacheError>;

impl ContextCacheError {
    /// Convert to a user-facing string for logging or tool boundaries.
    pub fn to_user_string(&self) -> String {
        self.to_string()
    }

    fn status_and_reason(&self) -> (StatusCode, String) {
        match self {
            ContextCacheError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            ContextCacheError::Unauthenticated => {
                (StatusCode::UNAUTHORIZED, "authentication required".into())
            }
            ContextCacheError::CrossTenant => {
                (StatusCode::FORBIDDEN, "cross-tenant access denied".into())
            }
            ContextCacheError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ContextCacheError::Conflict { .. } => {
                (StatusCode::CONFLICT, "content_hash collision".into())
            }
            ContextCacheError::GateRefused { reason, .. } => {
                (StatusCode::TOO_MANY_REQUESTS, reason.clone())
            }
            ContextCacheError::StoreUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
            ContextCacheError::Db(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            ContextCacheError::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            ContextCacheError::Json(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
            ContextCacheError::Http(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            ContextCacheError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            ContextCacheError::Anyhow(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl IntoResponse for ContextCacheError {
    fn into_response(self) -> Response {
        if matches!(
            self,
            ContextCacheError::Db(_)
                | ContextCacheError::Internal(_)
                | ContextCacheError::Anyhow(_)
        ) {
            tracing::error!(error = %self, "internal error surfaced to caller");
        }
        let (status, reason) = self.status_and_reason();
        let existing_id = match &self {
            ContextCacheError::Conflict { existing_id } => Some(*existing_id),
            _ => None,
        };
        let retry_after_seconds = match &self {
            ContextCacheError::GateRefused {
                retry_after_seconds,
                ..
            } => *retry_after_seconds,
            _ => None,
        };
        let body = ApiError {
            error: status.canonical_reason().unwrap_or("error").to_string(),
            reason,
            retry_after_seconds,
            existing_id,
        };
        (status, Json(body)).into_response()
    }
}

impl From<String> for ContextCacheError {
    fn from(s: String) -> Self {
        ContextCacheError::Internal(s)
    }
}

impl From<tokio::task::JoinError> for ContextCacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            ContextCacheError::Internal("task cancelled".into())
        } else {
            ContextCacheError::Internal(err.to_string())
        }
    }
}

impl From<ContextCacheError> for String {
    fn from(err: ContextCacheError) -> Self {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_refused_maps_to_429() {
        let err = ContextCacheError::GateRefused {
            reason: "daily recall limit exceeded".into(),
            retry_after_seconds: Some(120),
        };
        let (status, reason) = err.status_and_reason();
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(reason, "daily recall limit exceeded");
    }

    #[test]
    fn conflict_maps_to_409() {
        let err = ContextCacheError::Conflict { existing_id: 42 };
        let (status, _) = err.status_and_reason();
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[test]
    fn cross_tenant_maps_to_403() {
        let (status, _) = ContextCacheError::CrossTenant.status_and_reason();
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
