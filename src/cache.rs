//! TTL cache for raw feature payloads.
use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, Instant},
};

use serde_json::Value;

/// A cached payload together with its expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Raw features payload.
    pub value: Value,
    /// The entry is invisible to [`FeatureCache::get`] from this instant on.
    pub expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Storage for raw feature payloads keyed by `"{api_host}::{client_key}"`.
///
/// Implementations must be safe to share between threads.
pub trait FeatureCache: Send + Sync {
    /// Return the payload stored under `key` if it has not expired.
    fn get(&self, key: &str) -> Option<Value>;

    /// Store `value` under `key` for `ttl`.
    fn set(&self, key: &str, value: Value, ttl: Duration);

    /// Return the payload stored under `key` even if it has expired.
    ///
    /// Used to serve the last known payload when a refresh returns `304 Not Modified`. The default
    /// implementation only returns fresh entries.
    fn get_stale(&self, key: &str) -> Option<Value> {
        self.get(key)
    }
}

/// Process-local [`FeatureCache`].
#[derive(Debug, Default)]
pub struct InMemoryFeatureCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemoryFeatureCache {
    /// Create an empty cache.
    pub fn new() -> InMemoryFeatureCache {
        InMemoryFeatureCache::default()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}

impl FeatureCache for InMemoryFeatureCache {
    fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.value.clone())
    }

    fn set(&self, key: &str, value: Value, ttl: Duration) {
        let Ok(mut entries) = self.entries.write() else {
            log::warn!(target: "splitkit", key; "feature cache lock poisoned, dropping entry");
            return;
        };
        entries.insert(
            key.to_owned(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn get_stale(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().ok()?;
        entries.get(key).map(|entry| entry.value.clone())
    }
}
