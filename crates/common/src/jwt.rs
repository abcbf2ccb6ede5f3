//! JWT utilities shared across Carelink hub components.
//!
//! This module provides:
//! - Size limits checked before any parsing
//! - Clock skew constants for iat validation
//! - The user token claims structure (`id`, `role`, `exp`, `iat`)
//! - HS256 verification of user tokens into [`UserClaims`]
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - Only HS256 is accepted; `alg` in the header is never trusted
//! - Generic error messages prevent information leakage
//! - The `id` field in claims is redacted in Debug output
//!
//! # Usage
//!
//! ```rust,ignore
//! use common::jwt::{decode_user_token, DEFAULT_CLOCK_SKEW};
//!
//! let claims = decode_user_token(token, secret.as_bytes(), DEFAULT_CLOCK_SKEW)?;
//! let identity = claims.identity();
//! ```

use crate::types::{Identity, Role};
use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed JWT size in bytes (8KB).
///
/// Typical user tokens are 200-400 bytes. Anything larger than this is
/// rejected before base64 decoding or HMAC verification.
pub const MAX_JWT_SIZE_BYTES: usize = 8192; // 8KB

/// Default JWT clock skew tolerance (5 minutes).
///
/// Tokens with `iat` (issued-at) timestamps more than this amount in the
/// future are rejected.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Maximum allowed JWT clock skew tolerance (10 minutes).
///
/// Configuration values above this are rejected at startup.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during JWT validation.
///
/// Note: Error messages are intentionally generic to prevent information leakage.
/// Detailed information is logged at debug level for troubleshooting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds maximum allowed.
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Token format is invalid (not a valid JWT structure).
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// Signature does not match the shared secret, or the algorithm is wrong.
    #[error("The access token is invalid or expired")]
    InvalidSignature,

    /// Token `exp` is in the past.
    #[error("The access token is invalid or expired")]
    Expired,

    /// Token `iat` claim is too far in the future.
    #[error("The access token is invalid or expired")]
    IatTooFarInFuture,

    /// Claims decoded but are unusable (missing role, empty user id).
    #[error("The access token is invalid or expired")]
    InvalidClaims,
}

// =============================================================================
// Claims Types
// =============================================================================

/// User token claims.
///
/// Issued by the platform's login flow as `{id, role, iat, exp}`; the hub
/// only verifies them. `id` is the user id and is redacted in Debug output.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserClaims {
    /// User id - redacted in Debug output.
    pub id: String,

    /// Role of the user.
    pub role: Role,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Issued-at timestamp (Unix epoch seconds).
    pub iat: i64,
}

impl fmt::Debug for UserClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserClaims")
            .field("id", &"[REDACTED]")
            .field("role", &self.role)
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .finish()
    }
}

impl UserClaims {
    /// Creates a new `UserClaims` instance.
    #[must_use]
    pub fn new(id: impl Into<String>, role: Role, exp: i64, iat: i64) -> Self {
        Self {
            id: id.into(),
            role,
            exp,
            iat,
        }
    }

    /// Identity carried by these claims.
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity::new(self.id.clone(), self.role)
    }
}

// =============================================================================
// Functions
// =============================================================================

/// Reject tokens larger than [`MAX_JWT_SIZE_BYTES`].
///
/// # Errors
///
/// Returns `JwtValidationError::TokenTooLarge` if the token exceeds the limit.
pub fn check_token_size(token: &str) -> Result<(), JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }
    Ok(())
}

/// Verify an HS256 user token and return its claims.
///
/// Steps, in order: size check, signature and `exp` verification, `iat`
/// future bound, non-empty user id.
///
/// # Errors
///
/// Returns the `JwtValidationError` variant for the first failed step.
pub fn decode_user_token(
    token: &str,
    secret: &[u8],
    clock_skew: Duration,
) -> Result<UserClaims, JwtValidationError> {
    check_token_size(token)?;

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    let data = jsonwebtoken::decode::<UserClaims>(
        token,
        &DecodingKey::from_secret(secret),
        &validation,
    )
    .map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Token verification failed");
        match e.kind() {
            ErrorKind::ExpiredSignature => JwtValidationError::Expired,
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                JwtValidationError::InvalidSignature
            }
            ErrorKind::Json(_) | ErrorKind::MissingRequiredClaim(_) => {
                JwtValidationError::InvalidClaims
            }
            _ => JwtValidationError::MalformedToken,
        }
    })?;

    validate_iat(data.claims.iat, clock_skew)?;

    if data.claims.id.trim().is_empty() {
        tracing::debug!(target: "common.jwt", "Token rejected: empty user id");
        return Err(JwtValidationError::InvalidClaims);
    }

    Ok(data.claims)
}

/// Validate the `iat` (issued-at) claim with clock skew tolerance.
///
/// # Errors
///
/// Returns `JwtValidationError::IatTooFarInFuture` if the iat timestamp is more than
/// `clock_skew` in the future.
pub fn validate_iat(iat: i64, clock_skew: Duration) -> Result<(), JwtValidationError> {
    let now = chrono::Utc::now().timestamp();
    validate_iat_at(iat, clock_skew, now)
}

/// Deterministic `iat` validation against an explicit `now` timestamp.
pub(crate) fn validate_iat_at(
    iat: i64,
    clock_skew: Duration,
    now: i64,
) -> Result<(), JwtValidationError> {
    // clock_skew is bounded to MAX_CLOCK_SKEW by configuration
    #[allow(clippy::cast_possible_wrap)]
    let clock_skew_secs = clock_skew.as_secs() as i64;
    let max_iat = now + clock_skew_secs;

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            clock_skew_secs = clock_skew_secs,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
