//! Verdict cache for validated credentials.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::config::AuthConfig;

/// Upstream-reported rate-limit status captured at validation time.
#[derive(Debug, Clone, Default)]
pub struct UpstreamRateLimit {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset: Option<i64>,
}

/// Outcome of validating a credential against the upstream user endpoint.
#[derive(Debug, Clone)]
pub struct Verdict {
    /// Principal identity reported by upstream.
    pub login: String,
    /// OAuth scope set granted to the credential.
    pub scopes: Vec<String>,
    pub rate_limit: UpstreamRateLimit,
    /// Unix seconds of the validating round-trip.
    pub validated_at: i64,
    expires_at: Instant,
}

impl Verdict {
    pub fn new(
        login: String,
        scopes: Vec<String>,
        rate_limit: UpstreamRateLimit,
        ttl: Duration,
    ) -> Self {
        Verdict {
            login,
            scopes,
            rate_limit,
            validated_at: chrono::Utc::now().timestamp(),
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Thread-safe verdict cache keyed by salted credential hash.
pub struct AuthCache {
    store: DashMap<String, Verdict>,
    salt: [u8; 16],
    ttl: Duration,
    cleanup_interval: Duration,
}

impl AuthCache {
    pub fn new(config: &AuthConfig) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        AuthCache {
            store: DashMap::new(),
            salt,
            ttl: config.verdict_ttl,
            cleanup_interval: config.cleanup_interval,
        }
    }

    pub fn verdict_ttl(&self) -> Duration {
        self.ttl
    }

    /// Salted hash of `user:credential`; the only form a credential takes as
    /// a map key.
    pub fn cache_key(&self, username: &str, credential: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt);
        hasher.update(username.as_bytes());
        hasher.update([b':']);
        hasher.update(credential.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Return a non-expired verdict, removing an expired one on the way out.
    pub fn get(&self, username: &str, credential: &str) -> Option<Verdict> {
        let key = self.cache_key(username, credential);
        if let Some(verdict) = self.store.get(&key) {
            if !verdict.is_expired() {
                trace!("auth cache hit");
                return Some(verdict.clone());
            }
        } else {
            return None;
        }
        self.store.remove(&key);
        None
    }

    pub fn insert(&self, username: &str, credential: &str, verdict: Verdict) {
        let key = self.cache_key(username, credential);
        self.store.insert(key, verdict);
    }

    /// Drop every expired verdict. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let before = self.store.len();
        self.store.retain(|_, verdict| !verdict.is_expired());
        let removed = before - self.store.len();
        if removed > 0 {
            debug!(removed, remaining = self.store.len(), "auth cache sweep");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Spawn the periodic expired-verdict sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(cache.cleanup_interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                cache.sweep();
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
