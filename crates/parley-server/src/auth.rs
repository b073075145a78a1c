//! Verified-identity seam for the request/response surface.
//!
//! Credential checks, one-time codes, and token issuance all live in
//! the identity collaborator, outside this server. What the core needs
//! is one operation: turn an opaque bearer token into the username it
//! was verified for. `IdentityVerifier` is that seam; `TokenDirectory`
//! is the in-process directory the collaborator populates (or, for
//! local runs, the environment seeds).

use std::collections::HashMap;
use std::sync::RwLock;

use axum::extract::FromRequestParts;
use axum::http::{StatusCode, header, request::Parts};

use crate::AppState;

/// Resolves opaque bearer tokens to verified usernames.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<String>;
}

/// In-memory token -> username directory.
pub struct TokenDirectory {
    tokens: RwLock<HashMap<String, String>>,
}

impl TokenDirectory {
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Seed from `username=token` pairs (the parsed PARLEY_TOKENS
    /// form).
    pub fn with_tokens(pairs: &[(String, String)]) -> Self {
        let directory = Self::new();
        for (username, token) in pairs {
            directory.insert(token, username);
        }
        directory
    }

    /// Record a verified token for a username. Called by whatever
    /// fronts the identity collaborator.
    pub fn insert(&self, token: &str, username: &str) {
        self.tokens
            .write()
            .unwrap()
            .insert(token.to_string(), username.to_string());
    }

    /// Drop a token, e.g. after logout.
    pub fn revoke(&self, token: &str) {
        self.tokens.write().unwrap().remove(token);
    }
}

impl Default for TokenDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityVerifier for TokenDirectory {
    fn verify(&self, token: &str) -> Option<String> {
        self.tokens.read().unwrap().get(token).cloned()
    }
}

/// Extractor enforcing the verified-identity precondition on REST
/// routes. Carries the verified username.
#[derive(Debug)]
pub struct Verified(pub String);

impl FromRequestParts<AppState> for Verified {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(StatusCode::UNAUTHORIZED)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(StatusCode::UNAUTHORIZED)?;
        let username = state
            .verifier
            .verify(token)
            .ok_or(StatusCode::UNAUTHORIZED)?;
        Ok(Verified(username))
    }
}
