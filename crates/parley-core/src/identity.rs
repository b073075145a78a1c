//! Registered identities and their presence fields.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identity reference (UUID in string form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    /// Mint a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for IdentityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered user.
///
/// Created once at registration and only mutated afterwards. `online`
/// is derived state: true iff the session registry currently holds at
/// least one live connection for this identity, except while an explicit
/// away/back soft signal overrides it. Whichever path writes `online`
/// outside the connection derivation must also stamp `last_seen`.
///
/// The recent-contacts set lives in its own store table (insertion
/// order, no duplicates) rather than inline on this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    /// Unique, immutable after creation.
    pub username: String,
    pub online: bool,
    /// Unix millis of the last offline transition; `None` until the
    /// identity has gone offline at least once.
    pub last_seen: Option<u64>,
}
