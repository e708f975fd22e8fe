use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use crate::error::{blocking, ApiError};
use crate::AppState;

/// Identity resolved from the `Authorization` header, injected as a
/// request extension for downstream handlers.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: i64,
    pub username: String,
}

/// Resolves an opaque bearer token against the user store.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Auth)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::Auth)?
        .to_string();

    let db = state.db.clone();
    let user = blocking(move || db.verify_token(&token)).await?;

    req.extensions_mut().insert(CurrentUser {
        id: user.id,
        username: user.username,
    });
    Ok(next.run(req).await)
}
