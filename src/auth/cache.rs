//! In-process cache of positive authorization results.
//!
//! Keys are derived from a SHA-256 hash of the client's `Authorization`
//! header so raw credentials are never held in the map.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::cache::RepositoryIdentity;

/// Cache key for `authorization` on `identity`.
pub fn cache_key(authorization: Option<&str>, identity: &RepositoryIdentity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(authorization.unwrap_or_default().as_bytes());
    format!("{}:{}", hex::encode(hasher.finalize()), identity.key())
}

#[derive(Debug)]
pub struct AuthCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl AuthCache {
    /// A zero `ttl` disables caching.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_allowed(&self, key: &str) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(expires) if *expires > Instant::now() => {
                trace!(key, "auth cache hit");
                true
            }
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    pub fn allow(&self, key: String) {
        if self.ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, expires| *expires > now);
        entries.insert(key, now + self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
