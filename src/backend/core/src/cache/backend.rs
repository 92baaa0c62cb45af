//! Cache backend implementations.
//!
//! - **InMemoryBackend**: dashmap entries with TTL and oldest-first eviction
//! - **RedisBackend**: `SET key value EX ttl` on a shared Redis

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, TasklineError};

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Entry
// ═══════════════════════════════════════════════════════════════════════════════

/// A cached value with its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// JSON-encoded value
    pub data: Vec<u8>,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data,
            ttl,
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now()
            .signed_duration_since(self.created_at)
            .to_std()
            .map(|elapsed| elapsed >= self.ttl)
            .unwrap_or(false)
    }
}

/// Backend figures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub backend: String,
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn calculate_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Backend Trait
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Live entry under `key`. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Drop expired entries; returns how many went.
    async fn purge_expired(&self) -> Result<u64>;

    /// Number of stored entries, when the backend can tell cheaply.
    async fn len(&self) -> Result<Option<u64>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

pub struct InMemoryBackend {
    entries: DashMap<String, CacheEntry>,
    /// Insertion order, for capacity eviction. May hold stale keys.
    order: Mutex<VecDeque<String>>,
    max_capacity: usize,
    evictions: AtomicU64,
}

impl InMemoryBackend {
    pub fn new(max_capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_capacity: max_capacity.max(1),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Evict the oldest entries until there is room for one more.
    fn make_room(&self) {
        let mut order = self.order.lock();
        let mut evicted = 0;
        while self.entries.len() >= self.max_capacity {
            match order.pop_front() {
                Some(key) => {
                    if self.entries.remove(&key).is_some() {
                        evicted += 1;
                    }
                }
                None => break,
            }
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            debug!(evicted, "Evicted cache entries over capacity");
        }
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in_memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let expired = match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.value().clone())),
            Some(_) => true,
        };
        if expired {
            self.entries.remove_if(key, |_, e| e.is_expired());
        }
        Ok(None)
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        if !self.entries.contains_key(key) {
            self.make_room();
            self.order.lock().push_back(key.to_string());
        }
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let purged = before.saturating_sub(self.entries.len()) as u64;

        if purged > 0 {
            let mut order = self.order.lock();
            order.retain(|key| self.entries.contains_key(key));
        }
        Ok(purged)
    }

    async fn len(&self) -> Result<Option<u64>> {
        Ok(Some(self.entries.len() as u64))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis cache backend. Expiry is left to Redis.
pub struct RedisBackend {
    client: redis::Client,
}

impl RedisBackend {
    /// Build a client for `url`. No connection is made until first use.
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| TasklineError::cache(e.to_string()))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TasklineError::cache(format!("Failed to get Redis connection: {}", e)))
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.conn().await?;
        let data: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| TasklineError::cache(e.to_string()))?;

        match data {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        let mut conn = self.conn().await?;
        let ttl_secs = entry.ttl.as_secs().max(1);
        let data = serde_json::to_vec(&entry)?;

        redis::cmd("SET")
            .arg(key)
            .arg(data)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TasklineError::cache(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let deleted: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| TasklineError::cache(e.to_string()))?;
        Ok(deleted > 0)
    }

    async fn purge_expired(&self) -> Result<u64> {
        Ok(0)
    }

    async fn len(&self) -> Result<Option<u64>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ttl: Duration) -> CacheEntry {
        CacheEntry::new(b"1".to_vec(), ttl)
    }

    #[tokio::test]
    async fn test_expired_entry_reads_as_absent() {
        let backend = InMemoryBackend::new(10);
        let mut stale = entry(Duration::from_secs(1));
        stale.created_at = Utc::now() - chrono::Duration::seconds(5);
        backend.set("k", stale).await.unwrap();

        assert!(backend.get("k").await.unwrap().is_none());
        assert_eq!(backend.len().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let backend = InMemoryBackend::new(2);
        backend.set("a", entry(Duration::from_secs(60))).await.unwrap();
        backend.set("b", entry(Duration::from_secs(60))).await.unwrap();
        backend.set("c", entry(Duration::from_secs(60))).await.unwrap();

        assert!(backend.get("a").await.unwrap().is_none());
        assert!(backend.get("b").await.unwrap().is_some());
        assert!(backend.get("c").await.unwrap().is_some());
        assert_eq!(backend.evictions(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let backend = InMemoryBackend::new(2);
        backend.set("a", entry(Duration::from_secs(60))).await.unwrap();
        backend.set("b", entry(Duration::from_secs(60))).await.unwrap();
        backend.set("a", entry(Duration::from_secs(60))).await.unwrap();
        assert_eq!(backend.len().await.unwrap(), Some(2));
        assert_eq!(backend.evictions(), 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let backend = InMemoryBackend::new(10);
        let mut stale = entry(Duration::from_secs(1));
        stale.created_at = Utc::now() - chrono::Duration::seconds(5);
        backend.set("old", stale).await.unwrap();
        backend.set("fresh", entry(Duration::from_secs(60))).await.unwrap();

        assert_eq!(backend.purge_expired().await.unwrap(), 1);
        assert_eq!(backend.len().await.unwrap(), Some(1));
    }
}
