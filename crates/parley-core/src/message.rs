//! Message records and their delivery lifecycle.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::IdentityId;

/// Opaque message reference (UUID in string form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two lifecycle stages a status update can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Read,
}

/// One direct message between two identities.
///
/// Created exactly once; afterwards only the delivered/read flags move,
/// and only forward. `read == true` implies `delivered == true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: IdentityId,
    pub receiver_id: IdentityId,
    pub content: String,
    /// Unix millis, immutable.
    pub created_at: u64,
    pub delivered: bool,
    pub delivered_at: Option<u64>,
    pub read: bool,
    pub read_at: Option<u64>,
}

impl Message {
    /// Build a fresh record for the delivery pipeline. The delivered
    /// flag is decided by recipient presence at submission time.
    pub fn new(
        sender_id: IdentityId,
        receiver_id: IdentityId,
        content: String,
        created_at: u64,
        delivered: bool,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            sender_id,
            receiver_id,
            content,
            created_at,
            delivered,
            delivered_at: if delivered { Some(created_at) } else { None },
            read: false,
            read_at: None,
        }
    }

    /// Check the `read implies delivered` invariant.
    pub fn flags_consistent(&self) -> bool {
        !self.read || self.delivered
    }
}
