use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Extension, Json,
};

use warren_types::api::{CreateUserRequest, ResetPasswordRequest, TokenRequest, TokenResponse};

use crate::error::{blocking, ApiError};
use crate::middleware::CurrentUser;
use crate::users::user_response;
use crate::AppState;

/// POST /api/users — account creation, the one public write.
pub async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let user = blocking(move || {
        db.create_user(
            &req.username,
            &req.email,
            &req.password,
            req.name.as_deref(),
            req.bio.as_deref(),
        )
    })
    .await?;

    let location = format!("/api/users/{}", user.username);
    // The creator is the owner, so the email is included.
    let body = user_response(&user, true);

    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(body),
    ))
}

/// POST /api/tokens — exchanges credentials for the opaque bearer
/// token. Reissues the stored token while it is still fresh.
pub async fn issue_token(
    State(state): State<AppState>,
    Json(req): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let db = state.db.clone();
    let (token, expires_at) = blocking(move || {
        let user = db.authenticate(&req.username, &req.password)?;
        db.issue_token(user.id)
    })
    .await?;

    Ok(Json(TokenResponse { token, expires_at }))
}

/// DELETE /api/tokens — revokes the caller's token.
pub async fn revoke_token(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    blocking(move || db.revoke_token(current.id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/reset-password — consumes a signed reset credential.
/// Verification fails closed; the caller only ever learns "unauthorized".
pub async fn reset_password(
    State(state): State<AppState>,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.password.is_empty() {
        return Err(ApiError::Validation("Password must not be empty".into()));
    }

    let db = state.db.clone();
    let secret = state.secret.clone();
    blocking(move || db.reset_password(&req.token, &secret, &req.password)).await?;
    Ok(StatusCode::NO_CONTENT)
}
