//! Hub configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::jwt::{DEFAULT_CLOCK_SKEW, MAX_CLOCK_SKEW};
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default bind address for the WebSocket and HTTP endpoints.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default Postgres pool size.
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

/// Default idle time after which a room is reaped (2 hours).
pub const DEFAULT_ROOM_IDLE_TIMEOUT_SECONDS: u64 = 7200;

/// Default interval between idle checks in each room actor.
pub const DEFAULT_ROOM_REAPER_INTERVAL_SECONDS: u64 = 60;

/// Default per-connection outbound queue capacity.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Default `getMessages` page size.
pub const DEFAULT_MESSAGE_PAGE_DEFAULT: u32 = 50;

/// Upper bound on `getMessages` page size.
pub const DEFAULT_MESSAGE_PAGE_MAX: u32 = 200;

/// Default maximum chat message length in characters.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 4000;

/// Hub configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// HS256 secret shared with the token issuer.
    pub jwt_secret: SecretString,

    /// Postgres URL. `None` selects the in-memory repositories.
    pub database_url: Option<SecretString>,

    /// Postgres pool size (default: 10).
    pub db_max_connections: u32,

    /// Bind address for `/ws`, `/health`, `/ready` and `/metrics`.
    pub bind_address: String,

    /// Accept connections without a valid token (default: false).
    pub allow_anonymous: bool,

    /// Allowed `iat` skew for tokens (default: 300s, max: 600s).
    pub jwt_clock_skew: Duration,

    /// Rooms with no activity for this long are closed.
    pub room_idle_timeout: Duration,

    /// How often each room checks its idle timer.
    pub room_reaper_interval: Duration,

    /// Per-connection outbound queue capacity.
    pub outbound_queue_capacity: usize,

    /// Page size used when `getMessages` omits `limit`.
    pub message_page_default: u32,

    /// Largest accepted `getMessages` limit.
    pub message_page_max: u32,

    /// Maximum chat message length in characters.
    pub max_message_length: usize,

    /// Emit JSON log lines.
    pub log_json: bool,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("jwt_secret", &"[REDACTED]")
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("db_max_connections", &self.db_max_connections)
            .field("bind_address", &self.bind_address)
            .field("allow_anonymous", &self.allow_anonymous)
            .field("jwt_clock_skew", &self.jwt_clock_skew)
            .field("room_idle_timeout", &self.room_idle_timeout)
            .field("room_reaper_interval", &self.room_reaper_interval)
            .field("outbound_queue_capacity", &self.outbound_queue_capacity)
            .field("message_page_default", &self.message_page_default)
            .field("message_page_max", &self.message_page_max)
            .field("max_message_length", &self.max_message_length)
            .field("log_json", &self.log_json)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(format!("{key} has unparseable value '{raw}'"))
        }),
    }
}

fn require_positive<T: PartialOrd + Default>(key: &str, value: T) -> Result<T, ConfigError> {
    if value <= T::default() {
        return Err(ConfigError::InvalidValue(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(value)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let jwt_secret = vars
            .get("HUB_JWT_SECRET")
            .ok_or_else(|| ConfigError::MissingEnvVar("HUB_JWT_SECRET".to_string()))?;
        if jwt_secret.is_empty() {
            return Err(ConfigError::InvalidValue(
                "HUB_JWT_SECRET must not be empty".to_string(),
            ));
        }
        let jwt_secret = SecretString::from(jwt_secret.clone());

        let database_url = vars
            .get("DATABASE_URL")
            .filter(|url| !url.is_empty())
            .map(|url| SecretString::from(url.clone()));

        let db_max_connections = require_positive(
            "HUB_DB_MAX_CONNECTIONS",
            parse_var(vars, "HUB_DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?,
        )?;

        let bind_address = vars
            .get("HUB_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let allow_anonymous = parse_var(vars, "HUB_ALLOW_ANONYMOUS", false)?;

        let clock_skew_seconds = require_positive(
            "HUB_JWT_CLOCK_SKEW_SECONDS",
            parse_var(
                vars,
                "HUB_JWT_CLOCK_SKEW_SECONDS",
                DEFAULT_CLOCK_SKEW.as_secs(),
            )?,
        )?;
        if clock_skew_seconds > MAX_CLOCK_SKEW.as_secs() {
            return Err(ConfigError::InvalidValue(format!(
                "HUB_JWT_CLOCK_SKEW_SECONDS must not exceed {} seconds",
                MAX_CLOCK_SKEW.as_secs()
            )));
        }

        let room_idle_timeout_seconds = require_positive(
            "HUB_ROOM_IDLE_TIMEOUT_SECONDS",
            parse_var(
                vars,
                "HUB_ROOM_IDLE_TIMEOUT_SECONDS",
                DEFAULT_ROOM_IDLE_TIMEOUT_SECONDS,
            )?,
        )?;

        let room_reaper_interval_seconds = require_positive(
            "HUB_ROOM_REAPER_INTERVAL_SECONDS",
            parse_var(
                vars,
                "HUB_ROOM_REAPER_INTERVAL_SECONDS",
                DEFAULT_ROOM_REAPER_INTERVAL_SECONDS,
            )?,
        )?;

        let outbound_queue_capacity = require_positive(
            "HUB_OUTBOUND_QUEUE_CAPACITY",
            parse_var(
                vars,
                "HUB_OUTBOUND_QUEUE_CAPACITY",
                DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            )?,
        )?;

        let message_page_default = require_positive(
            "HUB_MESSAGE_PAGE_DEFAULT",
            parse_var(vars, "HUB_MESSAGE_PAGE_DEFAULT", DEFAULT_MESSAGE_PAGE_DEFAULT)?,
        )?;
        let message_page_max = require_positive(
            "HUB_MESSAGE_PAGE_MAX",
            parse_var(vars, "HUB_MESSAGE_PAGE_MAX", DEFAULT_MESSAGE_PAGE_MAX)?,
        )?;
        if message_page_default > message_page_max {
            return Err(ConfigError::InvalidValue(
                "HUB_MESSAGE_PAGE_DEFAULT must not exceed HUB_MESSAGE_PAGE_MAX".to_string(),
            ));
        }

        let max_message_length = require_positive(
            "HUB_MAX_MESSAGE_LENGTH",
            parse_var(vars, "HUB_MAX_MESSAGE_LENGTH", DEFAULT_MAX_MESSAGE_LENGTH)?,
        )?;

        let log_json = parse_var(vars, "HUB_LOG_JSON", false)?;

        Ok(Config {
            jwt_secret,
            database_url,
            db_max_connections,
            bind_address,
            allow_anonymous,
            jwt_clock_skew: Duration::from_secs(clock_skew_seconds),
            room_idle_timeout: Duration::from_secs(room_idle_timeout_seconds),
            room_reaper_interval: Duration::from_secs(room_reaper_interval_seconds),
            outbound_queue_capacity,
            message_page_default,
            message_page_max,
            max_message_length,
            log_json,
        })
    }
}
