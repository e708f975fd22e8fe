use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};

use warren_db::models::{PovRow, UserRow};
use warren_db::users::ProfilePatch;
use warren_types::api::{
    Collection, PovResponse, UpdateUserRequest, UpsertPovRequest, UserResponse,
};
use warren_types::models::PresenceStatus;

use crate::error::{blocking, ApiError};
use crate::middleware::CurrentUser;
use crate::pagination::{collection, PageQuery};
use crate::AppState;

pub(crate) fn user_response(row: &UserRow, include_email: bool) -> UserResponse {
    UserResponse {
        id: row.id,
        username: row.username.clone(),
        email: include_email.then(|| row.email.clone()),
        name: row.name.clone(),
        bio: row.bio.clone(),
        picture: row.picture.clone(),
        presence_status: PresenceStatus::from_i64(row.presence_status),
        shutdown_on_screen_off: row.shutdown_on_screen_off,
        last_online: row.last_online,
    }
}

fn pov_response(row: PovRow) -> PovResponse {
    PovResponse {
        user_id: row.user_id,
        display_name: row.display_name,
        note: row.note,
        mute_until: row.mute_until,
        min_push_interval_secs: row.min_push_interval_secs,
    }
}

/// GET /api/users/{username}
pub async fn get_user(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<UserResponse>, ApiError> {
    let db = state.db.clone();
    let user = blocking(move || db.get_user_by_username(&username))
        .await?
        .ok_or(ApiError::NotFound)?;

    // Email is private to the owner.
    Ok(Json(user_response(&user, current.id == user.id)))
}

/// GET /api/users — paginated listing with self/next/prev links.
pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
    Extension(_current): Extension<CurrentUser>,
) -> Result<Json<Collection<UserResponse>>, ApiError> {
    let (page, per_page) = query.clamped();

    let db = state.db.clone();
    let (rows, total) = blocking(move || db.list_users(page, per_page)).await?;

    let items = rows.iter().map(|row| user_response(row, false)).collect();
    Ok(Json(collection(items, page, per_page, total, "/api/users")))
}

/// PUT /api/users/{username} — canonical partial update, owner only.
pub async fn update_user(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Extension(current): Extension<CurrentUser>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    if current.username != username {
        return Err(ApiError::Forbidden);
    }

    let patch = ProfilePatch {
        name: req.name,
        bio: req.bio,
        email: req.email,
        picture: req.picture,
        presence_status: req.presence_status.map(PresenceStatus::as_i64),
        in_foreground: req.in_foreground,
        shutdown_on_screen_off: req.shutdown_on_screen_off,
    };

    let db = state.db.clone();
    let user = blocking(move || db.update_user(current.id, patch)).await?;
    Ok(Json(user_response(&user, true)))
}

/// DELETE /api/users/{username}/picture — clears the reference and
/// records the abandoned path.
pub async fn delete_picture(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Extension(current): Extension<CurrentUser>,
) -> Result<impl IntoResponse, ApiError> {
    if current.username != username {
        return Err(ApiError::Forbidden);
    }

    let db = state.db.clone();
    blocking(move || db.delete_picture(current.id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/users/{username}/pov — the caller's viewer-local
/// annotation of that contact. At most one row per pair.
pub async fn upsert_pov(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Extension(current): Extension<CurrentUser>,
    Json(req): Json<UpsertPovRequest>,
) -> Result<Json<PovResponse>, ApiError> {
    let db = state.db.clone();
    let row = blocking(move || {
        let subject = db
            .get_user_by_username(&username)?
            .ok_or(warren_db::StoreError::NotFound)?;
        db.upsert_pov(
            current.id,
            subject.id,
            req.display_name.as_deref(),
            req.note.as_deref(),
            req.mute_until,
            req.min_push_interval_secs,
        )
    })
    .await?;

    Ok(Json(pov_response(row)))
}
