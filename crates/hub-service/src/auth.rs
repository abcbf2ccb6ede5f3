//! Connection gatekeeper.
//!
//! Authenticates the WebSocket handshake. The bearer token is read from the
//! `Authorization` header, falling back to a `token` query parameter since
//! browsers cannot set headers on WebSocket upgrades.
//!
//! # Security
//!
//! - Verification is delegated to [`common::jwt::decode_user_token`]
//!   (size check, HS256 signature, `exp`, `iat` skew)
//! - Failures are logged at debug level without token material
//! - Client-facing messages are generic

use crate::config::Config;
use crate::errors::HubError;

use axum::http::{header, HeaderMap};
use common::jwt::decode_user_token;
use common::secret::{ExposeSecret, SecretString};
use common::types::Identity;
use std::time::Duration;
use tracing::{debug, instrument};

/// Verifies handshake tokens and decides whether anonymous connections are
/// admitted.
#[derive(Clone)]
pub struct Gatekeeper {
    secret: SecretString,
    clock_skew: Duration,
    allow_anonymous: bool,
}

impl Gatekeeper {
    #[must_use]
    pub fn new(secret: SecretString, clock_skew: Duration, allow_anonymous: bool) -> Self {
        Self {
            secret,
            clock_skew,
            allow_anonymous,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.jwt_secret.clone(),
            config.jwt_clock_skew,
            config.allow_anonymous,
        )
    }

    /// Verify one token into an [`Identity`].
    ///
    /// # Errors
    ///
    /// Returns `HubError::Authentication` for every verification failure.
    #[instrument(skip_all, name = "hub.auth.verify")]
    pub fn verify(&self, token: &str) -> Result<Identity, HubError> {
        let claims = decode_user_token(
            token,
            self.secret.expose_secret().as_bytes(),
            self.clock_skew,
        )
        .map_err(|e| {
            debug!(target: "hub.auth", error = ?e, "Token verification failed");
            HubError::from(e)
        })?;

        let identity = claims.identity();
        debug!(
            target: "hub.auth",
            user_id = %identity.user_id,
            role = %identity.role,
            "Token verified"
        );
        Ok(identity)
    }

    /// Authenticate a handshake.
    ///
    /// Returns `Ok(None)` for an anonymous connection that is allowed in.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Authentication` when the token is missing or
    /// invalid and anonymous connections are not allowed.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<Option<Identity>, HubError> {
        let Some(token) = extract_token(headers, query_token) else {
            if self.allow_anonymous {
                debug!(target: "hub.auth", "No token, admitting anonymous connection");
                return Ok(None);
            }
            debug!(target: "hub.auth", "No token on handshake");
            return Err(HubError::Authentication("Missing access token".to_string()));
        };

        match self.verify(token) {
            Ok(identity) => Ok(Some(identity)),
            Err(_) if self.allow_anonymous => {
                debug!(
                    target: "hub.auth",
                    "Invalid token, admitting anonymous connection"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    #[must_use]
    pub fn allows_anonymous(&self) -> bool {
        self.allow_anonymous
    }
}

/// Pick the handshake token: `Authorization: Bearer` first, then the query.
#[must_use]
pub fn extract_token<'a>(headers: &'a HeaderMap, query_token: Option<&'a str>) -> Option<&'a str> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    from_header.or_else(|| query_token.map(str::trim).filter(|t| !t.is_empty()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use common::jwt::UserClaims;
    use common::types::Role;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret-with-enough-entropy-0123456789";

    fn gatekeeper(allow_anonymous: bool) -> Gatekeeper {
        Gatekeeper::new(
            SecretString::from(SECRET),
            Duration::from_secs(300),
            allow_anonymous,
        )
    }

    fn token(id: &str, role: Role, secret: &str) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = UserClaims::new(id, role, now + 3600, now);
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn test_header_takes_precedence_over_query() {
        let headers = bearer("from-header");
        assert_eq!(
            extract_token(&headers, Some("from-query")),
            Some("from-header")
        );
        assert_eq!(
            extract_token(&HeaderMap::new(), Some("from-query")),
            Some("from-query")
        );
        assert_eq!(extract_token(&HeaderMap::new(), Some("  ")), None);
    }

    #[test]
    fn test_non_bearer_header_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_token(&headers, None), None);
    }

    #[test]
    fn test_valid_token_yields_identity() {
        let gk = gatekeeper(false);
        let identity = gk
            .authenticate(&bearer(&token("D1", Role::Doctor, SECRET)), None)
            .unwrap()
            .unwrap();
        assert_eq!(identity, Identity::new("D1", Role::Doctor));
    }

    #[test]
    fn test_query_token_yields_identity() {
        let gk = gatekeeper(false);
        let t = token("P1", Role::User, SECRET);
        let identity = gk.authenticate(&HeaderMap::new(), Some(&t)).unwrap();
        assert_eq!(identity, Some(Identity::new("P1", Role::User)));
    }

    #[test]
    fn test_missing_or_bad_token_rejected_by_default() {
        let gk = gatekeeper(false);
        assert!(matches!(
            gk.authenticate(&HeaderMap::new(), None),
            Err(HubError::Authentication(_))
        ));

        let forged = token("D1", Role::Doctor, "some-other-secret-0123456789abcdef");
        assert!(matches!(
            gk.authenticate(&bearer(&forged), None),
            Err(HubError::Authentication(_))
        ));
    }

    #[test]
    fn test_anonymous_mode_admits_without_identity() {
        let gk = gatekeeper(true);
        assert!(gk.allows_anonymous());
        assert_eq!(gk.authenticate(&HeaderMap::new(), None).unwrap(), None);
        assert_eq!(
            gk.authenticate(&bearer("not-a-jwt"), None).unwrap(),
            None
        );
    }
}
