//! Core types for the Parley messaging server.
//!
//! This crate holds the domain model shared by the server and by anything
//! that talks to it: identities, messages, conversation keys, and the
//! error taxonomy. It performs no I/O.

pub mod conversation;
pub mod error;
pub mod identity;
pub mod message;

pub use conversation::ConversationKey;
pub use error::{Error, Result};
pub use identity::{Identity, IdentityId};
pub use message::{DeliveryStatus, Message, MessageId};

/// Current time as unix milliseconds.
///
/// All Parley timestamps use this representation; `None` on optional
/// fields means "never".
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        // Sanity: later than 2020-01-01.
        assert!(a > 1_577_836_800_000);
    }
}
