use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::error;

use warren_db::StoreError;
use warren_types::api::ErrorBody;
use warren_types::models::InvalidTransition;

/// REST-facing failure taxonomy. Everything a handler can return maps
/// onto the JSON body `{error, message?}` with the matching status.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    /// Credential failures carry no detail about why.
    #[error("authentication failed")]
    Auth,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    /// Logged server-side, reported generically.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Validation(detail) => ApiError::Validation(detail),
            StoreError::Auth => ApiError::Auth,
            StoreError::NotFound => ApiError::NotFound,
            StoreError::InvalidTransition(t) => ApiError::InvalidTransition(t),
            StoreError::Internal(e) => ApiError::Internal(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Validation(detail) => (StatusCode::BAD_REQUEST, Some(detail)),
            ApiError::Auth => (StatusCode::UNAUTHORIZED, None),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, None),
            ApiError::NotFound => (StatusCode::NOT_FOUND, None),
            ApiError::InvalidTransition(t) => {
                error!("rejected delivery transition: {}", t);
                (
                    StatusCode::BAD_REQUEST,
                    Some("illegal delivery status transition".to_string()),
                )
            }
            ApiError::Internal(e) => {
                error!("internal error: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };

        let body = ErrorBody {
            error: status
                .canonical_reason()
                .unwrap_or("Unknown Error")
                .to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

/// Runs a blocking storage closure off the async runtime.
pub async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("spawn_blocking join error: {}", e)))?
        .map_err(ApiError::from)
}
