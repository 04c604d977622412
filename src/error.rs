/// Unified error types for Taskgate
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the authentication and authorization core
///
/// Authentication failures deliberately carry no detail: an expired, revoked,
/// forged and unknown token all surface as the same kind.
#[derive(Error, Debug)]
pub enum GateError {
    /// Bad, expired, revoked or unknown credential (refresh/reset token, password)
    #[error("Invalid credential")]
    InvalidCredential,

    /// Password accepted, second factor still pending
    #[error("Second factor required")]
    SecondFactorRequired,

    /// Submitted second-factor code did not verify
    #[error("Invalid second factor code")]
    SecondFactorInvalid,

    /// Missing, invalid or expired access token
    #[error("Unauthorized")]
    Unauthorized,

    /// CSRF mismatch or missing global permission
    #[error("Forbidden")]
    Forbidden,

    /// Project access level below the required minimum
    #[error("Access denied")]
    AccessDenied,

    /// System roles cannot be modified or deleted
    #[error("System roles are immutable")]
    ImmutableRole,

    /// The change would leave no active administrator
    #[error("Operation would remove the last active administrator")]
    LastAdminViolation,

    /// The change would leave a project without an owner
    #[error("Operation would remove the last project owner")]
    LastOwnerViolation,

    /// Unknown role, project or account
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict errors (e.g., duplicate account)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JWT encoding errors
    #[error("JWT error: {0}")]
    Jwt(String),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GateError {
    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            GateError::InvalidCredential => "InvalidCredential",
            GateError::SecondFactorRequired => "SecondFactorRequired",
            GateError::SecondFactorInvalid => "SecondFactorInvalid",
            GateError::Unauthorized => "Unauthorized",
            GateError::Forbidden => "Forbidden",
            GateError::AccessDenied => "AccessDenied",
            GateError::ImmutableRole => "ImmutableRole",
            GateError::LastAdminViolation => "LastAdminViolation",
            GateError::LastOwnerViolation => "LastOwnerViolation",
            GateError::NotFound(_) => "NotFound",
            GateError::Validation(_) => "InvalidRequest",
            GateError::Conflict(_) => "Conflict",
            GateError::Database(_)
            | GateError::Io(_)
            | GateError::Jwt(_)
            | GateError::Internal(_) => "InternalServerError",
        }
    }

    /// Store-layer I/O failure that an idempotent read may retry
    pub fn is_transient(&self) -> bool {
        match self {
            GateError::Database(e) => !matches!(
                e,
                sqlx::Error::RowNotFound
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::Decode(_)
                    | sqlx::Error::TypeNotFound { .. }
            ),
            GateError::Io(_) => true,
            _ => false,
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Convert GateError to HTTP response
impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = match self {
            GateError::InvalidCredential
            | GateError::SecondFactorRequired
            | GateError::SecondFactorInvalid
            | GateError::Unauthorized => StatusCode::UNAUTHORIZED,
            GateError::Forbidden | GateError::AccessDenied | GateError::ImmutableRole => {
                StatusCode::FORBIDDEN
            }
            GateError::LastAdminViolation
            | GateError::LastOwnerViolation
            | GateError::Conflict(_) => StatusCode::CONFLICT,
            GateError::NotFound(_) => StatusCode::NOT_FOUND,
            GateError::Validation(_) => StatusCode::BAD_REQUEST,
            GateError::Database(_) | GateError::Io(_) | GateError::Jwt(_) | GateError::Internal(_) => {
                tracing::error!(error = %self, "Request failed with internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = match self {
            // Don't leak details
            GateError::Database(_) | GateError::Io(_) | GateError::Jwt(_) | GateError::Internal(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(ErrorResponse {
            error: self.code().to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for Taskgate operations
pub type GateResult<T> = Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_do_not_leak_detail() {
        assert_eq!(GateError::InvalidCredential.to_string(), "Invalid credential");
        assert_eq!(GateError::Unauthorized.code(), "Unauthorized");
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (GateError::InvalidCredential, StatusCode::UNAUTHORIZED),
            (GateError::Unauthorized, StatusCode::UNAUTHORIZED),
            (GateError::Forbidden, StatusCode::FORBIDDEN),
            (GateError::AccessDenied, StatusCode::FORBIDDEN),
            (GateError::LastOwnerViolation, StatusCode::CONFLICT),
            (GateError::NotFound("role".into()), StatusCode::NOT_FOUND),
            (GateError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(GateError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!GateError::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!GateError::Forbidden.is_transient());
    }
}
