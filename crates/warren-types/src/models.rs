use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Self-reported availability of a user. Driven by profile updates and
/// by gateway connect/disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Unknown,
    Available,
    Offline,
    DoNotDisturb,
    CravingCommunication,
}

impl PresenceStatus {
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::Available,
            2 => Self::Offline,
            3 => Self::DoNotDisturb,
            4 => Self::CravingCommunication,
            _ => Self::Unknown,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Self::Unknown => 0,
            Self::Available => 1,
            Self::Offline => 2,
            Self::DoNotDisturb => 3,
            Self::CravingCommunication => 4,
        }
    }
}

/// Delivery lifecycle of a direct message. Transitions are forward-only
/// and single-step; everything else is an [`InvalidTransition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Received,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal delivery transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: DeliveryStatus,
    pub to: DeliveryStatus,
}

impl DeliveryStatus {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(Self::Sent),
            2 => Some(Self::Received),
            3 => Some(Self::Read),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Self::Sent => 1,
            Self::Received => 2,
            Self::Read => 3,
        }
    }

    /// Validates a requested transition. The store calls this before
    /// writing; callers never get to clamp or skip.
    pub fn advance_to(self, to: DeliveryStatus) -> Result<DeliveryStatus, InvalidTransition> {
        match (self, to) {
            (Self::Sent, Self::Received) | (Self::Received, Self::Read) => Ok(to),
            _ => Err(InvalidTransition { from: self, to }),
        }
    }
}

/// Which side of a conversation is acting. Soft deletes are scoped to
/// one side; the other side's view is untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationSide {
    Author,
    Recipient,
}
