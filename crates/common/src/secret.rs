//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used for the hub's signing secret, the
//! database URL and bearer tokens in transit. `SecretString` implements
//! `Debug` with redaction, so structs that derive `Debug` stay safe to log.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct HubSettings {
//!     bind_address: String,
//!     jwt_secret: SecretString,
//! }
//!
//! let settings = HubSettings {
//!     bind_address: "0.0.0.0:8080".to_string(),
//!     jwt_secret: SecretString::from("signing-key"),
//! };
//!
//! assert!(!format!("{settings:?}").contains("signing-key"));
//! assert_eq!(settings.jwt_secret.expose_secret(), "signing-key");
//! ```
//!
//! Use `SecretString` for:
//! - JWT signing secrets
//! - Database connection strings (they embed credentials)
//! - Bearer tokens read from a handshake

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("hunter2");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("postgres://hub:pw@db/hub");
        assert_eq!(secret.expose_secret(), "postgres://hub:pw@db/hub");
    }

    #[test]
    fn test_deserialize_keeps_value_hidden() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct SigningConfig {
            issuer: String,
            secret: SecretString,
        }

        let json = r#"{"issuer": "carelink", "secret": "my-secret-value"}"#;
        let config: SigningConfig = serde_json::from_str(json).expect("deserialize");

        assert_eq!(config.secret.expose_secret(), "my-secret-value");

        let debug = format!("{config:?}");
        assert!(debug.contains("carelink"));
        assert!(!debug.contains("my-secret-value"));
    }
}
