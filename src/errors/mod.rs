//! Error handling module for the meetvote backend.
//!
//! Provides centralized error types with mapping to HTTP status codes and response envelopes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Error codes as constants to avoid stringly-typed errors.
pub mod codes {
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const CONFLICT: &str = "CONFLICT";
    pub const VERSION_MISMATCH: &str = "VERSION_MISMATCH";
    pub const CLOSED: &str = "CLOSED";
    pub const INVALID_OPTION: &str = "INVALID_OPTION";
    pub const ALREADY_VOTED: &str = "ALREADY_VOTED";
    pub const NOT_CLOSED: &str = "NOT_CLOSED";
    pub const NO_TIE: &str = "NO_TIE";
    pub const ALREADY_DECIDED: &str = "ALREADY_DECIDED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
}

/// Application error type.
///
/// Every variant is scoped to the request that produced it; none is retried.
#[derive(Debug)]
pub enum AppError {
    /// Authentication required
    Unauthorized(String),
    /// Acting user is not allowed to perform the operation
    Forbidden(String),
    /// Meeting or voting does not exist
    NotFound(String),
    /// Validation error
    Validation(String),
    /// Uniqueness violation, e.g. an access PIN held by another active meeting
    Duplicate(String),
    /// Optimistic concurrency conflict
    Conflict {
        message: String,
        current_version: i64,
    },
    /// Voting (or meeting) no longer accepts writes
    Closed(String),
    /// Option label is not part of the voting
    InvalidOption(String),
    /// Participant already has a ledger entry
    AlreadyVoted(String),
    /// Tie-break attempted while the voting is still open
    NotClosed(String),
    /// Tie-break attempted on a voting without a tie
    NoTie(String),
    /// Tie-break already recorded
    AlreadyDecided(String),
    /// Database error
    Database(String),
    /// Internal server error
    Internal(String),
}

impl AppError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Duplicate(_) => StatusCode::CONFLICT,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::Closed(_) => StatusCode::CONFLICT,
            AppError::InvalidOption(_) => StatusCode::BAD_REQUEST,
            AppError::AlreadyVoted(_) => StatusCode::CONFLICT,
            AppError::NotClosed(_) => StatusCode::CONFLICT,
            AppError::NoTie(_) => StatusCode::CONFLICT,
            AppError::AlreadyDecided(_) => StatusCode::CONFLICT,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => codes::UNAUTHORIZED,
            AppError::Forbidden(_) => codes::FORBIDDEN,
            AppError::NotFound(_) => codes::NOT_FOUND,
            AppError::Validation(_) => codes::VALIDATION_ERROR,
            AppError::Duplicate(_) => codes::CONFLICT,
            AppError::Conflict { .. } => codes::VERSION_MISMATCH,
            AppError::Closed(_) => codes::CLOSED,
            AppError::InvalidOption(_) => codes::INVALID_OPTION,
            AppError::AlreadyVoted(_) => codes::ALREADY_VOTED,
            AppError::NotClosed(_) => codes::NOT_CLOSED,
            AppError::NoTie(_) => codes::NO_TIE,
            AppError::AlreadyDecided(_) => codes::ALREADY_DECIDED,
            AppError::Database(_) => codes::DATABASE_ERROR,
            AppError::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        match self {
            AppError::Unauthorized(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::Validation(msg)
            | AppError::Duplicate(msg)
            | AppError::Closed(msg)
            | AppError::InvalidOption(msg)
            | AppError::AlreadyVoted(msg)
            | AppError::NotClosed(msg)
            | AppError::NoTie(msg)
            | AppError::AlreadyDecided(msg)
            | AppError::Database(msg)
            | AppError::Internal(msg) => msg.clone(),
            AppError::Conflict { message, .. } => message.clone(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())
    }
}

impl std::error::Error for AppError {}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        AppError::Database(format!("Database error: {}", err))
    }
}

/// Error details in the response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Error response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetails,
}

impl ErrorResponse {
    pub fn new(error: &AppError) -> Self {
        let details = match error {
            AppError::Conflict {
                current_version, ..
            } => Some(serde_json::json!({ "currentVersion": current_version })),
            _ => None,
        };

        Self {
            success: false,
            error: ErrorDetails {
                code: error.error_code().to_string(),
                message: error.message(),
                details,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse::new(&self);
        (status, Json(body)).into_response()
    }
}

/// True when a sqlx error is a UNIQUE / PRIMARY KEY constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voting_errors_map_to_codes() {
        assert_eq!(
            AppError::AlreadyVoted("x".into()).error_code(),
            codes::ALREADY_VOTED
        );
        assert_eq!(
            AppError::Closed("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::InvalidOption("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Forbidden("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_conflict_envelope_carries_version() {
        let err = AppError::Conflict {
            message: "stale".into(),
            current_version: 7,
        };
        let body = ErrorResponse::new(&err);
        assert!(!body.success);
        assert_eq!(body.error.code, codes::VERSION_MISMATCH);
        assert_eq!(body.error.details.unwrap()["currentVersion"], 7);
    }
}
