use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use tracing::warn;

use warren_db::models::MessageRow;
use warren_db::StoreError;
use warren_types::api::{
    Collection, EditMessageRequest, MessageResponse, SendMessageRequest, SetStatusRequest,
};
use warren_types::events::GatewayEvent;
use warren_types::models::{ConversationSide, DeliveryStatus};

use crate::error::{blocking, ApiError};
use crate::middleware::CurrentUser;
use crate::pagination::{collection, PageQuery};
use crate::AppState;

fn message_response(row: &MessageRow) -> MessageResponse {
    MessageResponse {
        id: row.id,
        body: row.body.clone(),
        sent_at: row.sent_at,
        sender_id: row.sender_id,
        recipient_id: row.recipient_id,
        edited: row.edited,
        delivery_status: DeliveryStatus::from_i64(row.delivery_status).unwrap_or_else(|| {
            warn!(
                "Corrupt delivery status {} on message {}",
                row.delivery_status, row.id
            );
            DeliveryStatus::Sent
        }),
    }
}

/// GET /api/messages/{username} — the conversation with that user,
/// ascending. Fetching acknowledges delivery: anything still `Sent`
/// toward the caller moves to `Received` first, so the page reflects
/// the post-fetch state.
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<Collection<MessageResponse>>, ApiError> {
    let (page, per_page) = query.clamped();

    let db = state.db.clone();
    let base_path = format!("/api/messages/{}", username);
    let (rows, total) = blocking(move || {
        let other = db
            .get_user_by_username(&username)?
            .ok_or(StoreError::NotFound)?;
        db.mark_received(current.id, other.id)?;
        db.conversation(current.id, other.id, page, per_page)
    })
    .await?;

    let items = rows.iter().map(message_response).collect();
    Ok(Json(collection(items, page, per_page, total, &base_path)))
}

/// POST /api/messages/{username} — REST send path. Persists at `Sent`,
/// then pushes to any live connection of the recipient and advances to
/// `Received`, exactly like the socket direct path.
pub async fn send_message(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Extension(current): Extension<CurrentUser>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let (recipient_id, row) = blocking(move || {
        let recipient = db
            .get_user_by_username(&username)?
            .ok_or(StoreError::NotFound)?;
        let row = db.append_message(current.id, recipient.id, &req.body)?;
        Ok((recipient.id, row))
    })
    .await?;

    let mut row = row;
    let delivered = state.dispatcher.send_to_user(
        recipient_id,
        GatewayEvent::DirectMessage {
            id: row.id,
            from: current.username.clone(),
            body: row.body.clone(),
            sent_at: row.sent_at,
            delivery_status: DeliveryStatus::Sent,
        },
    );

    if delivered {
        let db = state.db.clone();
        let message_id = row.id;
        row = blocking(move || db.set_delivery_status(message_id, DeliveryStatus::Received))
            .await?;
    }

    Ok((StatusCode::CREATED, Json(message_response(&row))))
}

/// PUT /api/messages/by-id/{id} — edit, author only.
pub async fn edit_message(
    State(state): State<AppState>,
    Path(message_id): Path<i64>,
    Extension(current): Extension<CurrentUser>,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let db = state.db.clone();
    let row = blocking(move || {
        let row = db.get_message(message_id)?.ok_or(StoreError::NotFound)?;
        if row.sender_id != current.id {
            return Err(StoreError::Auth);
        }
        db.edit_message(message_id, &req.body)
    })
    .await
    .map_err(forbid_auth)?;

    Ok(Json(message_response(&row)))
}

/// DELETE /api/messages/by-id/{id} — soft delete for the caller's side only.
pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<i64>,
    Extension(current): Extension<CurrentUser>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    blocking(move || {
        let row = db.get_message(message_id)?.ok_or(StoreError::NotFound)?;
        let side = if row.sender_id == current.id {
            ConversationSide::Author
        } else if row.recipient_id == current.id {
            ConversationSide::Recipient
        } else {
            return Err(StoreError::Auth);
        };
        db.soft_delete(message_id, side)
    })
    .await
    .map_err(forbid_auth)?;

    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/messages/by-id/{id}/status — explicit forward-only transition,
/// recipient only.
pub async fn set_status(
    State(state): State<AppState>,
    Path(message_id): Path<i64>,
    Extension(current): Extension<CurrentUser>,
    Json(req): Json<SetStatusRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let db = state.db.clone();
    let row = blocking(move || {
        let row = db.get_message(message_id)?.ok_or(StoreError::NotFound)?;
        if row.recipient_id != current.id {
            return Err(StoreError::Auth);
        }
        db.set_delivery_status(message_id, req.status)
    })
    .await
    .map_err(forbid_auth)?;

    Ok(Json(message_response(&row)))
}

/// Inside these handlers an auth failure means "not your message", so
/// surface it as 403 rather than 401.
fn forbid_auth(e: ApiError) -> ApiError {
    match e {
        ApiError::Auth => ApiError::Forbidden,
        other => other,
    }
}
