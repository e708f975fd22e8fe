use thiserror::Error;
use warren_types::models::InvalidTransition;

/// Store-level failure taxonomy. The REST layer maps these onto HTTP
/// statuses; the gateway maps them onto per-event error payloads.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Bad or duplicate input. The detail is user-correctable and safe
    /// to surface.
    #[error("{0}")]
    Validation(String),

    /// Missing/invalid/expired credential. Deliberately carries no
    /// detail about why.
    #[error("authentication failed")]
    Auth,

    #[error("not found")]
    NotFound,

    /// Illegal delivery-status transition. A protocol/logic bug on the
    /// caller's side; logged server-side, reported generically.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Internal(e.into())
    }
}

impl StoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        StoreError::Validation(msg.into())
    }
}
