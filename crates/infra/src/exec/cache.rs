//! Cache-aside helper with per-entry TTL.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-memory TTL cache owned by a single connector instance.
///
/// A read at or past `expires_at` is a miss; expired values are never served.
#[derive(Debug)]
pub struct TtlCache<V> {
    default_ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync,
{
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Live value for `key`, if any.
    pub async fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.is_live(Instant::now()))
            .map(|e| e.value.clone())
    }

    pub async fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let expires_at = Instant::now() + ttl.unwrap_or(self.default_ttl);
        self.entries
            .write()
            .await
            .insert(key.into(), CacheEntry { value, expires_at });
    }

    /// Return the live entry for `key`, or call `fetcher`, store its value and return it.
    ///
    /// Fetch errors are returned as-is and nothing is cached.
    pub async fn get_cached<F, Fut, E>(&self, key: &str, fetcher: F, ttl: Option<Duration>) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(key).await {
            debug!(cache_key = key, "cache hit");
            return Ok(hit);
        }

        debug!(cache_key = key, "cache miss");
        let value = fetcher().await?;
        self.set(key, value.clone(), ttl).await;
        Ok(value)
    }

    /// Remove every key matching `pattern`.
    ///
    /// The pattern is a key prefix; a trailing `*` is accepted and ignored, and a lone
    /// `*` clears everything. Returns how many entries were removed.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(pattern, removed, "cache invalidated");
        }
        removed
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Drop expired entries; returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.read().await.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
