use gator_db::StoreError;
use thiserror::Error;

/// Error taxonomy shared by every component boundary in this crate (§7).
/// The HTTP layer maps each variant to a status code and a stable error
/// code string; nothing below this type needs to know about HTTP.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Stable string code, part of the HTTP API contract (§7).
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidStateTransition { .. } => "INVALID_STATE",
            Self::Conflict(_) => "CONFLICT",
            Self::Precondition(_) => "CONFLICT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => Self::NotFound { kind, id },
            StoreError::InvalidStateTransition { from, to } => Self::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            },
            StoreError::Conflict(reason) => Self::Conflict(reason),
            StoreError::Precondition(reason) => Self::Precondition(reason),
            StoreError::Sqlx(e) => Self::Internal(e.into()),
            StoreError::Io(e) => Self::Internal(e.into()),
        }
    }
}
