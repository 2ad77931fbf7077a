//! In-memory OAuth token cache.
//!
//! Keys are `"{token_url}::{client_id}"`, extended with `"::{scope}"` when a
//! scope is set. Entries expire `safety_buffer` seconds before the provider's
//! `expires_in` so a token is never presented at the edge of its lifetime;
//! the computed expiry is clamped to "now" at worst. The cache is in-memory
//! only and never persisted.

use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::time::Instant;

/// Default provider lifetime when `expires_in` is absent.
pub const DEFAULT_EXPIRES_IN: u64 = 3600;
/// Seconds subtracted from `expires_in` before the entry expires.
pub const SAFETY_BUFFER: u64 = 30;

static GLOBAL: Lazy<std::sync::Arc<TokenCache>> =
    Lazy::new(|| std::sync::Arc::new(TokenCache::new()));

/// A token as returned by a supplier.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    /// The bearer token.
    pub access_token: String,
    /// Token type, typically `Bearer`.
    pub token_type: String,
    /// Granted scope, if reported.
    pub scope: Option<String>,
    /// Provider lifetime in seconds, if reported.
    pub expires_in: Option<u64>,
}

/// A cached token with its computed expiry.
#[derive(Debug, Clone)]
pub struct CachedToken {
    /// The bearer token.
    pub access_token: String,
    /// Token type.
    pub token_type: String,
    /// Granted scope.
    pub scope: Option<String>,
    /// When the cache stops serving this token.
    pub expires_at: Instant,
}

/// Keyed token store.
#[derive(Default)]
pub struct TokenCache {
    entries: DashMap<String, CachedToken>,
}

impl TokenCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-global cache shared by bearer policies.
    pub fn global() -> std::sync::Arc<TokenCache> {
        GLOBAL.clone()
    }

    /// Derives the cache key for a supplier identity.
    pub fn derive_key(token_url: &str, client_id: &str, scope: Option<&str>) -> String {
        match scope {
            Some(scope) => format!("{token_url}::{client_id}::{scope}"),
            None => format!("{token_url}::{client_id}"),
        }
    }

    /// Returns a live token, deleting and skipping expired entries.
    pub fn get(&self, key: &str) -> Option<CachedToken> {
        {
            let entry = self.entries.get(key)?;
            if Instant::now() < entry.expires_at {
                return Some(entry.clone());
            }
        }
        self.entries.remove(key);
        None
    }

    /// Stores a grant under a key.
    pub fn set(&self, key: &str, grant: &TokenGrant) {
        let expires_at = expires_at(Instant::now(), grant.expires_in, SAFETY_BUFFER);
        self.entries.insert(
            key.to_string(),
            CachedToken {
                access_token: grant.access_token.clone(),
                token_type: grant.token_type.clone(),
                scope: grant.scope.clone(),
                expires_at,
            },
        );
    }

    /// Removes one entry.
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// `now + max(0, expires_in - buffer)`; never earlier than `now`.
pub fn expires_at(now: Instant, expires_in: Option<u64>, buffer: u64) -> Instant {
    let lifetime = expires_in.unwrap_or(DEFAULT_EXPIRES_IN).saturating_sub(buffer);
    now + Duration::from_secs(lifetime)
}
