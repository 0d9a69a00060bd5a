//! Error taxonomy, error codes, and machine-actionable recovery hints.

use serde::{Deserialize, Serialize};

use crate::model::LocalId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Session is gone; the user has to log in again.
    Login,
    /// Reissue the same operation.
    Retry,
    /// The live feed reconnects on its own; pagination stays authoritative.
    Resubscribe,
    None,
}

/// Failure of a single history page request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("authentication required")]
    AuthRequired,

    #[error("channel not found or not accessible")]
    NotFound,

    #[error("transient failure: {0}")]
    Transient(String),
}

/// Failure of a message submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("authentication required")]
    AuthRequired,

    #[error("channel not found or not accessible")]
    NotFound,

    #[error("invalid message: {0}")]
    Validation(String),

    #[error("transient failure: {0}")]
    Transient(String),
}

/// Failure to open or keep a live subscription.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("authentication required")]
    AuthRequired,

    #[error("live feed unavailable: {0}")]
    Unavailable(String),
}

impl FetchError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::AuthRequired => "auth_required",
            Self::NotFound => "not_found",
            Self::Transient(_) => "transient",
        }
    }

    pub fn recovery(&self) -> RecoveryAction {
        match self {
            Self::AuthRequired => RecoveryAction::Login,
            Self::NotFound => RecoveryAction::None,
            Self::Transient(_) => RecoveryAction::Retry,
        }
    }
}

impl SendError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::AuthRequired => "auth_required",
            Self::NotFound => "not_found",
            Self::Validation(_) => "validation",
            Self::Transient(_) => "transient",
        }
    }

    pub fn recovery(&self) -> RecoveryAction {
        match self {
            Self::AuthRequired => RecoveryAction::Login,
            Self::NotFound | Self::Validation(_) => RecoveryAction::None,
            Self::Transient(_) => RecoveryAction::Retry,
        }
    }
}

impl FeedError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::AuthRequired => "auth_required",
            Self::Unavailable(_) => "live_feed_degraded",
        }
    }

    pub fn recovery(&self) -> RecoveryAction {
        match self {
            Self::AuthRequired => RecoveryAction::Login,
            Self::Unavailable(_) => RecoveryAction::Resubscribe,
        }
    }
}

/// Value held in a stream's observable error slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamError {
    #[error("authentication required")]
    AuthRequired,

    #[error("channel not found or not accessible")]
    NotFound,

    #[error("transient failure: {message}")]
    Transient { message: String },

    #[error("invalid message: {message}")]
    Validation { message: String },

    #[error("live feed degraded: {message}")]
    LiveFeedDegraded { message: String },

    /// An optimistic send was rejected. The text is kept so it is not lost.
    #[error("message not sent: {reason}")]
    SendFailed {
        local_id: LocalId,
        text: String,
        reason: String,
        retryable: bool,
    },
}

impl StreamError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::AuthRequired => "auth_required",
            Self::NotFound => "not_found",
            Self::Transient { .. } => "transient",
            Self::Validation { .. } => "validation",
            Self::LiveFeedDegraded { .. } => "live_feed_degraded",
            Self::SendFailed { .. } => "send_failed",
        }
    }

    pub fn recovery(&self) -> RecoveryAction {
        match self {
            Self::AuthRequired => RecoveryAction::Login,
            Self::NotFound | Self::Validation { .. } => RecoveryAction::None,
            Self::Transient { .. } => RecoveryAction::Retry,
            Self::LiveFeedDegraded { .. } => RecoveryAction::Resubscribe,
            Self::SendFailed { retryable, .. } => {
                if *retryable {
                    RecoveryAction::Retry
                } else {
                    RecoveryAction::None
                }
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.recovery(), RecoveryAction::Retry)
    }

    /// Error-slot value for a rejected send of `text`.
    pub fn send_failed(local_id: LocalId, text: String, err: &SendError) -> Self {
        Self::SendFailed {
            local_id,
            text,
            reason: err.to_string(),
            retryable: matches!(err.recovery(), RecoveryAction::Retry),
        }
    }
}

impl From<FetchError> for StreamError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::AuthRequired => Self::AuthRequired,
            FetchError::NotFound => Self::NotFound,
            FetchError::Transient(message) => Self::Transient { message },
        }
    }
}

impl From<FeedError> for StreamError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::AuthRequired => Self::AuthRequired,
            FeedError::Unavailable(message) => Self::LiveFeedDegraded { message },
        }
    }
}
