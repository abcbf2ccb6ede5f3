//! Hub error types.
//!
//! Every error maps to a stable client code and a client-safe message. The
//! dispatcher turns errors into `error` events for the triggering connection
//! only; persistence details are logged server-side and never sent out.

use common::jwt::JwtValidationError;
use thiserror::Error;

/// Hub error type.
///
/// Client codes:
/// - `Authentication`: `UNAUTHENTICATED`
/// - `Authorization`: `FORBIDDEN`
/// - `NotFound`: `NOT_FOUND`
/// - `Validation`: `INVALID_REQUEST`
/// - `Persistence`, `Internal`, `RoomClosed`: `INTERNAL_ERROR`
#[derive(Debug, Error)]
pub enum HubError {
    /// No identity, or the handshake token failed verification.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Identity is known but not allowed to perform the action.
    #[error("Forbidden: {0}")]
    Authorization(String),

    /// Appointment, conversation or membership not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed frame or payload that fails validation.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Repository read/write failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Channel or actor failure.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The room actor stopped before handling the request.
    ///
    /// Retried once by the registry handle; surfaces as internal otherwise.
    #[error("Room closed")]
    RoomClosed,
}

impl HubError {
    /// Returns the client error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            HubError::Authentication(_) => "UNAUTHENTICATED",
            HubError::Authorization(_) => "FORBIDDEN",
            HubError::NotFound(_) => "NOT_FOUND",
            HubError::Validation(_) => "INVALID_REQUEST",
            HubError::Persistence(_) | HubError::Internal(_) | HubError::RoomClosed => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            HubError::Authentication(_) => "Authentication required".to_string(),
            HubError::Persistence(_) | HubError::Internal(_) | HubError::RoomClosed => {
                "An internal error occurred".to_string()
            }
            HubError::Authorization(msg) | HubError::NotFound(msg) | HubError::Validation(msg) => {
                msg.clone()
            }
        }
    }

    /// Short label for metrics.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            HubError::Authentication(_) => "unauthenticated",
            HubError::Authorization(_) => "forbidden",
            HubError::NotFound(_) => "not_found",
            HubError::Validation(_) => "invalid",
            HubError::Persistence(_) => "persistence_error",
            HubError::Internal(_) | HubError::RoomClosed => "internal_error",
        }
    }
}

impl From<sqlx::Error> for HubError {
    fn from(err: sqlx::Error) -> Self {
        HubError::Persistence(err.to_string())
    }
}

impl From<JwtValidationError> for HubError {
    fn from(err: JwtValidationError) -> Self {
        HubError::Authentication(err.to_string())
    }
}
