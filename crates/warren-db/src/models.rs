/// Database row types — these map directly to SQLite rows.
/// Distinct from the warren-types API models to keep the storage layer
/// independent of the wire shapes.
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub token: Option<String>,
    pub token_expires: Option<DateTime<Utc>>,
    pub name: Option<String>,
    pub bio: Option<String>,
    pub picture: Option<String>,
    pub presence_status: i64,
    pub in_foreground: bool,
    pub shutdown_on_screen_off: bool,
    pub last_online: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub sender_id: i64,
    pub recipient_id: i64,
    pub edited: bool,
    pub deleted_for_author: bool,
    pub deleted_for_recipient: bool,
    pub delivery_status: i64,
}

#[derive(Debug, Clone)]
pub struct PovRow {
    pub id: i64,
    pub pov_user_id: i64,
    pub user_id: i64,
    pub display_name: Option<String>,
    pub note: Option<String>,
    pub mute_until: Option<DateTime<Utc>>,
    pub min_push_interval_secs: Option<i64>,
}
