//! Error types for map-core.

use thiserror::Error;

/// Result type alias using map-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for orchestrator operations
#[derive(Error, Debug)]
pub enum Error {
    // Lookup errors
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    // Validation errors
    #[error("string=\"{value}\" is not a valid choice.")]
    InvalidChoice { value: String },

    #[error("Validation error: {0}")]
    Validation(String),

    // Uniqueness / identity errors
    #[error("Conflict: {0}")]
    Conflict(String),

    // Remote facility errors
    #[error("Facility unreachable at {url}: {reason}")]
    FacilityUnreachable { url: String, reason: String },

    // Database errors
    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    // Auth errors
    #[error("Invalid token")]
    InvalidToken,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a not-found error for an entity
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create a facility-unreachable error
    pub fn unreachable(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::FacilityUnreachable {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error is a validation error (including bad status strings)
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::InvalidChoice { .. })
    }

    /// Check if this error is a uniqueness conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Errors a background task should recover from by retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FacilityUnreachable { .. } | Self::LockPoisoned | Self::Database(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, ref message)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Conflict(
                    message
                        .clone()
                        .unwrap_or_else(|| "uniqueness constraint violated".to_string()),
                )
            }
            other => Self::Database(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
