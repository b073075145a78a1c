//! Error types for parley-core.

use thiserror::Error;

/// Errors that can occur on the presence and delivery write paths.
#[derive(Debug, Error)]
pub enum Error {
    /// An identity or message reference did not resolve. Surfaced to the
    /// caller, never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// A message addressed to its own sender. Rejected before anything
    /// is persisted.
    #[error("sender and receiver must differ")]
    InvalidRecipient,

    /// The persistence layer failed or was unreachable. Logged and
    /// surfaced as a failed operation; the core never retries on its
    /// own, re-issuing is the caller's call.
    #[error("store failure: {0}")]
    TransientStoreFailure(String),

    /// A push targeted a connection that has since closed. Dropped
    /// silently by the session registry, never fatal to a write path.
    #[error("session closed")]
    StaleSession,
}

impl Error {
    /// Wrap a storage-layer error.
    pub fn store(err: impl std::fmt::Display) -> Self {
        Error::TransientStoreFailure(err.to_string())
    }

    /// A missing identity or message, by description.
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }
}

/// Result type alias for parley operations.
pub type Result<T> = std::result::Result<T, Error>;
