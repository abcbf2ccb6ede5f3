//! Common data types for Carelink hub components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of an authenticated principal.
///
/// Serialized lowercase (`"doctor"`, `"user"`) to match the token claims and
/// the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A clinician conducting consultations.
    Doctor,
    /// A patient.
    User,
}

impl Role {
    /// Wire representation of the role.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Doctor => "doctor",
            Role::User => "user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated identity attached to a connection by the gatekeeper.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Stable user identifier (token `sub`).
    pub user_id: String,
    /// Role claimed by the token.
    pub role: Role,
}

impl Identity {
    /// Create a new identity.
    #[must_use]
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}
