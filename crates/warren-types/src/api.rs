use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DeliveryStatus, PresenceStatus};

// -- Users --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub name: Option<String>,
    pub bio: Option<String>,
}

/// Public representation of a user. `email` is only populated when the
/// requester is the user themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub name: Option<String>,
    pub bio: Option<String>,
    pub picture: Option<String>,
    pub presence_status: PresenceStatus,
    pub shutdown_on_screen_off: bool,
    pub last_online: DateTime<Utc>,
}

/// Canonical partial update. Absent fields are left unchanged; a
/// present-but-null picture clears it (and abandons the old path).
#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub name: Option<String>,
    pub bio: Option<String>,
    pub email: Option<String>,
    #[serde(default, with = "double_option")]
    pub picture: Option<Option<String>>,
    pub presence_status: Option<PresenceStatus>,
    pub in_foreground: Option<bool>,
    pub shutdown_on_screen_off: Option<bool>,
}

/// Distinguishes "field absent" from "field explicitly null".
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(de).map(Some)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpsertPovRequest {
    pub display_name: Option<String>,
    pub note: Option<String>,
    pub mute_until: Option<DateTime<Utc>>,
    pub min_push_interval_secs: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PovResponse {
    pub user_id: i64,
    pub display_name: Option<String>,
    pub note: Option<String>,
    pub mute_until: Option<DateTime<Utc>>,
    pub min_push_interval_secs: Option<i64>,
}

// -- Tokens --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub body: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditMessageRequest {
    pub body: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetStatusRequest {
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: i64,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub sender_id: i64,
    pub recipient_id: i64,
    pub edited: bool,
    pub delivery_status: DeliveryStatus,
}

// -- Pagination envelope --

#[derive(Debug, Serialize, Deserialize)]
pub struct PageMeta {
    pub page: u32,
    pub per_page: u32,
    pub total_pages: u32,
    pub total_items: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PageLinks {
    #[serde(rename = "self")]
    pub self_link: String,
    pub next: Option<String>,
    pub prev: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Collection<T> {
    pub items: Vec<T>,
    #[serde(rename = "_meta")]
    pub meta: PageMeta,
    #[serde(rename = "_links")]
    pub links: PageLinks,
}

// -- Errors --

/// Wire shape for every REST error.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
