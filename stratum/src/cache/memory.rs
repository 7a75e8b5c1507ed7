//! In-memory LRU cache provider.

use crate::cache::{glob_match, CacheHealth, CacheProvider, CacheStats};
use crate::error::Result;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
    size: usize,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

struct Inner {
    entries: LruCache<String, Entry>,
    memory_bytes: usize,
    stats: CacheStats,
}

/// LRU cache bounded by entry count and resident bytes, with a background
/// sweep for expired keys.
pub struct MemoryCache {
    inner: Mutex<Inner>,
    max_memory_bytes: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize, max_memory_bytes: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap();
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                memory_bytes: 0,
                stats: CacheStats::default(),
            }),
            max_memory_bytes,
        }
    }

    /// Starts the periodic expiry sweep. The task runs until aborted.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                cache.sweep_expired();
            }
        })
    }

    /// Evicts every expired entry; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        let count = expired.len();
        for key in expired {
            if let Some(entry) = inner.entries.pop(&key) {
                inner.memory_bytes -= entry.size;
                inner.stats.evictions += 1;
            }
        }
        count
    }

    fn estimate_size(key: &str, value: &Value) -> usize {
        key.len() + value.to_string().len()
    }

    fn insert(&self, inner: &mut Inner, key: String, value: Value, ttl: Option<Duration>) {
        let size = Self::estimate_size(&key, &value);
        if let Some(old) = inner.entries.pop(&key) {
            inner.memory_bytes -= old.size;
        }
        inner.memory_bytes += size;
        inner.entries.put(
            key,
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
                size,
            },
        );
        inner.stats.sets += 1;
        // LruCache already bounds the entry count; enforce the byte budget.
        while inner.memory_bytes > self.max_memory_bytes {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.memory_bytes -= evicted.size;
                    inner.stats.evictions += 1;
                }
                None => break,
            }
        }
    }

    fn get_live(&self, inner: &mut Inner, key: &str) -> Option<Value> {
        let now = Instant::now();
        let expired = match inner.entries.get(key) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                inner.stats.hits += 1;
                return Some(entry.value.clone());
            }
            None => false,
        };
        if expired {
            if let Some(entry) = inner.entries.pop(key) {
                inner.memory_bytes -= entry.size;
                inner.stats.evictions += 1;
            }
        }
        inner.stats.misses += 1;
        None
    }
}

#[async_trait]
impl CacheProvider for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut inner = self.inner.lock();
        Ok(self.get_live(&mut inner, key))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock();
        self.insert(&mut inner, key.to_string(), value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.entries.pop(key) {
            Some(entry) => {
                inner.memory_bytes -= entry.size;
                inner.stats.deletes += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.memory_bytes = 0;
        Ok(())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        let mut inner = self.inner.lock();
        Ok(keys
            .iter()
            .map(|key| self.get_live(&mut inner, key))
            .collect())
    }

    async fn set_many(&self, entries: Vec<(String, Value)>, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock();
        for (key, value) in entries {
            self.insert(&mut inner, key, value, ttl);
        }
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = inner.entries.pop(key) {
                inner.memory_bytes -= entry.size;
                inner.stats.deletes += 1;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64> {
        let mut inner = self.inner.lock();
        let matching: Vec<String> = inner
            .entries
            .iter()
            .filter(|(key, _)| glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        let mut removed = 0;
        for key in matching {
            if let Some(entry) = inner.entries.pop(&key) {
                inner.memory_bytes -= entry.size;
                inner.stats.deletes += 1;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<CacheHealth> {
        let inner = self.inner.lock();
        Ok(CacheHealth {
            healthy: true,
            latency: Duration::ZERO,
            details: serde_json::json!({
                "provider": "memory",
                "entries": inner.entries.len(),
                "memory_bytes": inner.memory_bytes,
            }),
        })
    }

    fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.entries = inner.entries.len();
        stats.memory_bytes = inner.memory_bytes;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let cache = MemoryCache::new(16, 1 << 20);
        cache.set("k", json!({"n": 1}), None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!({"n": 1})));
        assert!(cache.get("missing").await.unwrap().is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = MemoryCache::new(16, 1 << 20);
        cache
            .set("k", json!(1), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(cache.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lru_bound_evicts_oldest() {
        let cache = MemoryCache::new(2, 1 << 20);
        cache.set("a", json!(1), None).await.unwrap();
        cache.set("b", json!(2), None).await.unwrap();
        cache.get("a").await.unwrap();
        cache.set("c", json!(3), None).await.unwrap();
        // "b" was least recently used.
        assert!(cache.get("b").await.unwrap().is_none());
        assert!(cache.get("a").await.unwrap().is_some());
        assert!(cache.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_budget_is_enforced() {
        let cache = MemoryCache::new(1024, 64);
        let big = json!("x".repeat(40));
        cache.set("a", big.clone(), None).await.unwrap();
        cache.set("b", big.clone(), None).await.unwrap();
        assert!(cache.stats().memory_bytes <= 64);
        assert!(cache.stats().evictions >= 1);
    }

    #[tokio::test]
    async fn pattern_invalidation() {
        let cache = MemoryCache::new(16, 1 << 20);
        cache.set("user:1", json!(1), None).await.unwrap();
        cache.set("user:2", json!(2), None).await.unwrap();
        cache.set("session:1", json!(3), None).await.unwrap();
        let removed = cache.invalidate_pattern("user:*").await.unwrap();
        assert_eq!(removed, 2);
        assert!(cache.get("user:1").await.unwrap().is_none());
        assert!(cache.get("session:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let cache = Arc::new(MemoryCache::new(16, 1 << 20));
        cache
            .set("short", json!(1), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        cache.set("long", json!(2), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test]
    async fn bulk_operations() {
        let cache = MemoryCache::new(16, 1 << 20);
        cache
            .set_many(
                vec![("a".into(), json!(1)), ("b".into(), json!(2))],
                None,
            )
            .await
            .unwrap();
        let values = cache
            .get_many(&["a".into(), "missing".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some(json!(1)), None, Some(json!(2))]);
        assert_eq!(
            cache.delete_many(&["a".into(), "b".into(), "c".into()]).await.unwrap(),
            2
        );
    }
}
