//! Query Result Cache
//!
//! Read results keyed by (model, query descriptor), with TTL expiry and
//! coarse per-model invalidation on every write.

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::canonical::content_digest;
use super::error::Result;

/// Storage behind the result cache. Implementations must be thread-safe.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value, ttl: Duration);

    /// Drop every entry whose key starts with `prefix`.
    fn invalidate_prefix(&self, prefix: &str);

    fn clear(&self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// In-process cache with lazy expiry
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.read().len(),
        }
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }
        // expired
        self.entries.write().remove(key);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn set(&self, key: &str, value: Value, ttl: Duration) {
        self.entries.write().insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn invalidate_prefix(&self, prefix: &str) {
        self.entries.write().retain(|k, _| !k.starts_with(prefix));
    }

    fn clear(&self) {
        self.entries.write().clear();
    }
}

/// Builds cache keys and applies TTL defaults over a [`CacheBackend`].
pub struct ResultCache {
    backend: Arc<dyn CacheBackend>,
    prefix: String,
    default_ttl: Duration,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn CacheBackend>, prefix: &str, default_ttl: Duration) -> Self {
        Self {
            backend,
            prefix: prefix.to_string(),
            default_ttl,
        }
    }

    fn model_prefix(&self, model: &str) -> String {
        format!("{}{}:", self.prefix, model)
    }

    /// `prefix + model + ":" + sha256(canonical descriptor)`
    pub fn key(&self, model: &str, descriptor: &Value) -> Result<String> {
        Ok(format!("{}{}", self.model_prefix(model), content_digest(descriptor)?))
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let hit = self.backend.get(key);
        debug!(key, hit = hit.is_some(), "cache lookup");
        hit
    }

    pub fn put(&self, key: &str, value: Value, ttl: Option<Duration>) {
        self.backend.set(key, value, ttl.unwrap_or(self.default_ttl));
    }

    /// Forget every cached result for a model.
    pub fn invalidate(&self, model: &str) {
        debug!(model, "cache invalidated");
        self.backend.invalidate_prefix(&self.model_prefix(model));
    }

    pub fn clear(&self) {
        self.backend.clear();
    }
}
