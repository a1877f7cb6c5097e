//! Ledger error types.

use super::PayloadError;
use crate::canonical::CanonicalError;
use thiserror::Error;

/// Errors raised by the [`Landscape`](super::Landscape).
#[derive(Debug, Error)]
pub enum LandscapeError {
    /// The ledger's own records are inconsistent: a dangling parent edge,
    /// a NULL where a value is structurally required, an unknown enum
    /// value, a second terminal outcome. Never recovered from.
    #[error("audit integrity violation: {0}")]
    Integrity(String),

    /// A referenced record does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Record kind (`run`, `token`, ...).
        entity: &'static str,
        /// Identifier looked up.
        id: String,
    },

    /// A status transition the ledger does not allow.
    #[error("invalid transition for {entity} '{id}': {reason}")]
    InvalidTransition {
        /// Record kind.
        entity: &'static str,
        /// Identifier.
        id: String,
        /// What was attempted.
        reason: String,
    },

    /// A row's payload was deleted by retention.
    #[error("payload for row '{row_id}' has been purged")]
    PayloadPurged {
        /// Row whose payload is gone.
        row_id: String,
    },

    /// Value could not be canonically encoded.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// Payload store failure.
    #[error(transparent)]
    Payload(#[from] PayloadError),

    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    /// File-system failure opening the database.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl LandscapeError {
    pub(crate) fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity(message.into())
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Returns true for Tier-1 corruption.
    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }
}

impl From<rusqlite::Error> for LandscapeError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::FromSqlConversionFailure(idx, ty, source) => Self::Integrity(format!(
                "column {idx} holds an unreadable {ty} value: {source}"
            )),
            rusqlite::Error::InvalidColumnType(idx, name, ty) => {
                Self::Integrity(format!("column {idx} ('{name}') holds unexpected {ty}"))
            }
            other => Self::Sqlite(other),
        }
    }
}

/// Convenience alias used throughout the ledger.
pub type Result<T> = std::result::Result<T, LandscapeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_column_is_integrity() {
        let err: LandscapeError = rusqlite::Error::InvalidColumnType(
            3,
            "reproducibility_grade".into(),
            rusqlite::types::Type::Null,
        )
        .into();
        assert!(err.is_integrity());
        assert!(err.to_string().contains("reproducibility_grade"));
    }

    #[test]
    fn test_other_sqlite_errors_pass_through() {
        let err: LandscapeError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, LandscapeError::Sqlite(_)));
    }
}
