//! Error codes surfaced to the front end and typed cache errors.
use thiserror::Error;

/// Codes carried in `{"error": {"code", "message"}}` bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    SenderShiftNotFound,
    RecipientShiftNotFound,
    UserCredentialsNotFound,
    ChangeRequestNotFound,
    ShiftNotFound,
    OpenShiftNotFound,
    ConnectionNotFound,
    RequestInProgress,
    OpenShiftRequestDeclined,
    NotSupported,
    InvalidRequest,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SenderShiftNotFound => "SenderShiftNotFound",
            ErrorCode::RecipientShiftNotFound => "RecipientShiftNotFound",
            ErrorCode::UserCredentialsNotFound => "UserCredentialsNotFound",
            ErrorCode::ChangeRequestNotFound => "ChangeRequestNotFound",
            ErrorCode::ShiftNotFound => "ShiftNotFound",
            ErrorCode::OpenShiftNotFound => "OpenShiftNotFound",
            ErrorCode::ConnectionNotFound => "ConnectionNotFound",
            ErrorCode::RequestInProgress => "RequestInProgress",
            ErrorCode::OpenShiftRequestDeclined => "OpenShiftRequestDeclined",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InvalidRequest => "InvalidRequest",
            ErrorCode::InternalError => "InternalError",
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("partition {schedule_id}/{week} is leased by another writer")]
    LeaseConflict { schedule_id: String, week: String },
    #[error("gave up acquiring lease after {attempts} attempts")]
    LeaseExhausted { attempts: u32 },
    #[error("lease on {schedule_id}/{week} expired or was taken over")]
    LeaseLost { schedule_id: String, week: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("snapshot encoding error: {0}")]
    Serde(#[from] serde_json::Error),
}
