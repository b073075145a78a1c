//! Server configuration from the environment.

use std::path::PathBuf;

const DEFAULT_ADDR: &str = "0.0.0.0:4310";
const DEFAULT_DB: &str = "parley.db";

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (`PARLEY_ADDR`).
    pub addr: String,
    /// SQLite database path (`PARLEY_DB`).
    pub db_path: PathBuf,
    /// Pre-verified username/token pairs (`PARLEY_TOKENS`), for local
    /// runs without the identity collaborator in front.
    pub tokens: Vec<(String, String)>,
}

impl Config {
    pub fn from_env() -> Self {
        let addr = std::env::var("PARLEY_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
        let db_path = std::env::var("PARLEY_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB));
        let tokens = std::env::var("PARLEY_TOKENS")
            .map(|raw| parse_tokens(&raw))
            .unwrap_or_default();
        Self {
            addr,
            db_path,
            tokens,
        }
    }
}

/// Parse `alice=tok1,bob=tok2` into username/token pairs. Malformed
/// entries are skipped.
pub fn parse_tokens(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (username, token) = pair.split_once('=')?;
            let (username, token) = (username.trim(), token.trim());
            if username.is_empty() || token.is_empty() {
                return None;
            }
            Some((username.to_string(), token.to_string()))
        })
        .collect()
}
