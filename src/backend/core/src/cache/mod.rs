//! Computation cache.
//!
//! A TTL-bound key/value store for memoizing expensive deterministic
//! computations performed inside job bodies. It is independent from job
//! status tracking and tolerates stale reads.
//!
//! # Usage
//!
//! ```rust,ignore
//! let positions: Vec<f64> = cache
//!     .get_or_compute("ephemeris", &inputs, None, || async { compute(&inputs).await })
//!     .await?;
//! ```
//!
//! Backend failures never fail the caller: they are logged and the value is
//! recomputed.

pub mod backend;
pub mod key;

pub use backend::{CacheBackend, CacheEntry, CacheStats, InMemoryBackend, RedisBackend};
pub use key::CacheKey;

use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::Result;

/// Memoizing cache shared by handlers through `JobContext::cache()`.
pub struct ComputationCache {
    backend: Arc<dyn CacheBackend>,
    key_prefix: String,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ComputationCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            key_prefix: config.key_prefix.clone(),
            default_ttl: config.default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Redis-backed when `redis_url` is set, in-memory otherwise.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        let backend: Arc<dyn CacheBackend> = match &config.redis_url {
            Some(url) => Arc::new(RedisBackend::new(url)?),
            None => Arc::new(InMemoryBackend::new(config.max_capacity)),
        };
        Ok(Self::new(backend, config))
    }

    pub fn in_memory(config: &CacheConfig) -> Self {
        Self::new(Arc::new(InMemoryBackend::new(config.max_capacity)), config)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Cached value for `inputs` under `namespace`, if present and decodable.
    pub async fn get<I, T>(&self, namespace: &str, inputs: &I) -> Option<T>
    where
        I: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let key = self.storage_key(namespace, inputs)?;
        self.lookup(&key).await
    }

    /// Store `value` for `inputs` under `namespace`.
    pub async fn set<I, T>(&self, namespace: &str, inputs: &I, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        I: Serialize + ?Sized,
        T: Serialize,
    {
        let key = CacheKey::for_inputs(namespace, inputs)?.render(&self.key_prefix);
        let entry = CacheEntry::new(serde_json::to_vec(value)?, ttl.unwrap_or(self.default_ttl));
        self.backend.set(&key, entry).await
    }

    /// Return the cached value or run `compute` and cache its success.
    ///
    /// Errors from `compute` are returned unchanged and never cached.
    pub async fn get_or_compute<I, T, E, F, Fut>(
        &self,
        namespace: &str,
        inputs: &I,
        ttl: Option<Duration>,
        compute: F,
    ) -> std::result::Result<T, E>
    where
        I: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let key = self.storage_key(namespace, inputs);
        if let Some(key) = &key {
            if let Some(value) = self.lookup(key).await {
                return Ok(value);
            }
        }

        let value = compute().await?;

        if let Some(key) = key {
            match serde_json::to_vec(&value) {
                Ok(data) => {
                    let entry = CacheEntry::new(data, ttl.unwrap_or(self.default_ttl));
                    if let Err(e) = self.backend.set(&key, entry).await {
                        warn!(key = %key, error = %e, "Failed to store computed value");
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "Computed value is not cacheable"),
            }
        }
        Ok(value)
    }

    /// Drop the entry for `inputs`. Returns whether one existed.
    pub async fn invalidate<I: Serialize + ?Sized>(&self, namespace: &str, inputs: &I) -> Result<bool> {
        let key = CacheKey::for_inputs(namespace, inputs)?.render(&self.key_prefix);
        self.backend.delete(&key).await
    }

    /// Evict expired entries.
    pub async fn sweep(&self) -> Result<u64> {
        let purged = self.backend.purge_expired().await?;
        if purged > 0 {
            debug!(purged, backend = self.backend.name(), "Swept expired cache entries");
        }
        Ok(purged)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats {
            backend: self.backend.name().to_string(),
            entries: self.backend.len().await?.unwrap_or(0),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: 0,
            hit_rate: 0.0,
        };
        stats.calculate_hit_rate();
        Ok(stats)
    }

    fn storage_key<I: Serialize + ?Sized>(&self, namespace: &str, inputs: &I) -> Option<String> {
        match CacheKey::for_inputs(namespace, inputs) {
            Ok(key) => Some(key.render(&self.key_prefix)),
            Err(e) => {
                warn!(namespace, error = %e, "Inputs cannot be keyed, bypassing cache");
                None
            }
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.backend.get(key).await {
            Ok(Some(entry)) => match serde_json::from_slice(&entry.data) {
                Ok(value) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    counter!("taskline_cache_requests_total", "result" => "hit").increment(1);
                    Some(value)
                }
                Err(e) => {
                    warn!(key, error = %e, "Cached value does not decode, recomputing");
                    counter!("taskline_cache_requests_total", "result" => "error").increment(1);
                    None
                }
            },
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                counter!("taskline_cache_requests_total", "result" => "miss").increment(1);
                None
            }
            Err(e) => {
                warn!(key, error = %e, backend = self.backend.name(), "Cache read failed, recomputing");
                counter!("taskline_cache_requests_total", "result" => "error").increment(1);
                None
            }
        }
    }
}

impl std::fmt::Debug for ComputationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationCache")
            .field("backend", &self.backend.name())
            .field("key_prefix", &self.key_prefix)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn cache() -> ComputationCache {
        ComputationCache::in_memory(&CacheConfig::default())
    }

    #[tokio::test]
    async fn test_get_or_compute_memoizes() {
        let cache = cache();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: std::result::Result<i64, String> = cache
                .get_or_compute("square", &json!({"n": 7}), None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(49)
                })
                .await;
            assert_eq!(value.unwrap(), 49);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = cache();
        let failed: std::result::Result<i64, String> = cache
            .get_or_compute("flaky", &1, None, || async { Err("boom".to_string()) })
            .await;
        assert!(failed.is_err());
        assert!(cache.get::<_, i64>("flaky", &1).await.is_none());
    }

    #[tokio::test]
    async fn test_set_and_invalidate() {
        let cache = cache();
        cache.set("ns", &[1, 2], &"value", None).await.unwrap();
        assert_eq!(cache.get::<_, String>("ns", &[1, 2]).await.as_deref(), Some("value"));

        assert!(cache.invalidate("ns", &[1, 2]).await.unwrap());
        assert!(cache.get::<_, String>("ns", &[1, 2]).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_recompute() {
        let cache = cache();
        cache.set("ns", "k", &1, Some(Duration::ZERO)).await.unwrap();
        assert!(cache.get::<_, i64>("ns", "k").await.is_none());
    }
}
