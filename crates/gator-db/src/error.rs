use thiserror::Error;

use crate::models::MissionState;

/// Errors raised by the [`Store`](crate::Store) boundary.
///
/// Mirrors the taxonomy every higher layer maps to an HTTP status: the
/// mapping itself lives in `gator-core::error` since this crate has no
/// HTTP concept, but the variant shapes line up 1:1.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: MissionState,
        to: MissionState,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Translate a raw sqlx error into `Conflict` when it is a unique
    /// constraint violation, otherwise pass it through unchanged.
    pub fn from_sqlx_write(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return Self::Conflict(db_err.message().to_owned());
            }
        }
        Self::Sqlx(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
