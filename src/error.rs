//! Error types for the circulation server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Machine-readable error codes returned alongside every rejected operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    InvalidState,
    NotAuthorized,
    AlreadyBorrowed,
    Conflict,
    ExtensionLimitExceeded,
    HoldConflict,
    TaskAlreadyResolved,
    InstanceSuspended,
    DefinitionNotFound,
    BadValue,
    NotAuthenticated,
    DbFailure,
    CacheFailure,
    NotificationFailure,
    Failure,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::NotAuthorized => "NOT_AUTHORIZED",
            ErrorCode::AlreadyBorrowed => "ALREADY_BORROWED",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::ExtensionLimitExceeded => "EXTENSION_LIMIT_EXCEEDED",
            ErrorCode::HoldConflict => "HOLD_CONFLICT",
            ErrorCode::TaskAlreadyResolved => "TASK_ALREADY_RESOLVED",
            ErrorCode::InstanceSuspended => "INSTANCE_SUSPENDED",
            ErrorCode::DefinitionNotFound => "DEFINITION_NOT_FOUND",
            ErrorCode::BadValue => "BAD_VALUE",
            ErrorCode::NotAuthenticated => "NOT_AUTHENTICATED",
            ErrorCode::DbFailure => "DB_FAILURE",
            ErrorCode::CacheFailure => "CACHE_FAILURE",
            ErrorCode::NotificationFailure => "NOTIFICATION_FAILURE",
            ErrorCode::Failure => "FAILURE",
        }
    }
}

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Already borrowed: {0}")]
    AlreadyBorrowed(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Extension limit exceeded: {used}/{max} extensions used")]
    ExtensionLimitExceeded { used: i32, max: i32 },

    #[error("Hold conflict: {0}")]
    HoldConflict(String),

    #[error("Task already resolved: {0}")]
    TaskAlreadyResolved(String),

    #[error("Instance suspended: {0}")]
    InstanceSuspended(String),

    #[error("Workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::NotFound(_) => ErrorCode::NotFound,
            AppError::InvalidState(_) => ErrorCode::InvalidState,
            AppError::NotAuthorized(_) => ErrorCode::NotAuthorized,
            AppError::AlreadyBorrowed(_) => ErrorCode::AlreadyBorrowed,
            AppError::Conflict(_) => ErrorCode::Conflict,
            AppError::ExtensionLimitExceeded { .. } => ErrorCode::ExtensionLimitExceeded,
            AppError::HoldConflict(_) => ErrorCode::HoldConflict,
            AppError::TaskAlreadyResolved(_) => ErrorCode::TaskAlreadyResolved,
            AppError::InstanceSuspended(_) => ErrorCode::InstanceSuspended,
            AppError::DefinitionNotFound(_) => ErrorCode::DefinitionNotFound,
            AppError::Validation(_) => ErrorCode::BadValue,
            AppError::Authentication(_) => ErrorCode::NotAuthenticated,
            AppError::Database(_) => ErrorCode::DbFailure,
            AppError::Cache(_) => ErrorCode::CacheFailure,
            AppError::Notification(_) => ErrorCode::NotificationFailure,
            AppError::Internal(_) => ErrorCode::Failure,
        }
    }

    /// True for lost optimistic-concurrency races that a caller may retry
    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::Conflict(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) | AppError::DefinitionNotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidState(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotAuthorized(_) => StatusCode::FORBIDDEN,
            AppError::AlreadyBorrowed(_)
            | AppError::Conflict(_)
            | AppError::HoldConflict(_)
            | AppError::TaskAlreadyResolved(_) => StatusCode::CONFLICT,
            AppError::ExtensionLimitExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::InstanceSuspended(_) => StatusCode::LOCKED,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::Database(_)
            | AppError::Cache(_)
            | AppError::Notification(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

/// Error response body
#[derive(Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub error: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let message = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                "Database error".to_string()
            }
            AppError::Cache(e) => {
                tracing::error!("Cache error: {:?}", e);
                "Cache error".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            code,
            error: code.as_str().to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct_per_kind() {
        assert_eq!(AppError::AlreadyBorrowed("a".into()).code(), ErrorCode::AlreadyBorrowed);
        assert_eq!(
            AppError::ExtensionLimitExceeded { used: 2, max: 2 }.code(),
            ErrorCode::ExtensionLimitExceeded
        );
        assert_eq!(AppError::InstanceSuspended("x".into()).status(), StatusCode::LOCKED);
        assert!(AppError::Conflict("stale".into()).is_conflict());
        assert!(!AppError::InvalidState("done".into()).is_conflict());
    }

    #[test]
    fn test_code_strings_match_serde_names() {
        let json = serde_json::to_string(&ErrorCode::TaskAlreadyResolved).unwrap();
        assert_eq!(json, format!("\"{}\"", ErrorCode::TaskAlreadyResolved.as_str()));
    }
}
