//! Layered caching.
//!
//! A [`CacheProvider`] abstracts over the in-memory LRU, the Redis-backed
//! distributed cache, and the no-op provider. The adaptive-TTL decorator
//! wraps any of them.

pub mod adaptive;
pub mod memory;
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Running counters reported by every provider.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub entries: usize,
    pub memory_bytes: usize,
}

/// Health report from a provider ping.
#[derive(Debug, Clone)]
pub struct CacheHealth {
    pub healthy: bool,
    pub latency: Duration,
    /// Provider-specific details (server version, memory, connections).
    pub details: Value,
}

#[async_trait]
pub trait CacheProvider: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Stores a value; `ttl` of `None` means no expiry.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// Returns true when the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn clear(&self) -> Result<()>;

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Value>>>;

    async fn set_many(&self, entries: Vec<(String, Value)>, ttl: Option<Duration>) -> Result<()>;

    /// Returns the number of keys removed.
    async fn delete_many(&self, keys: &[String]) -> Result<u64>;

    /// Removes every key matching a glob pattern (`*` and `?`). Returns the
    /// number of keys removed.
    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64>;

    async fn ping(&self) -> Result<CacheHealth>;

    fn stats(&self) -> CacheStats;
}

/// Provider that caches nothing. Used when caching is disabled.
pub struct NoopCache;

#[async_trait]
impl CacheProvider for NoopCache {
    async fn get(&self, _key: &str) -> Result<Option<Value>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Value, _ttl: Option<Duration>) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        Ok(vec![None; keys.len()])
    }

    async fn set_many(&self, _entries: Vec<(String, Value)>, _ttl: Option<Duration>) -> Result<()> {
        Ok(())
    }

    async fn delete_many(&self, _keys: &[String]) -> Result<u64> {
        Ok(0)
    }

    async fn invalidate_pattern(&self, _pattern: &str) -> Result<u64> {
        Ok(0)
    }

    async fn ping(&self) -> Result<CacheHealth> {
        Ok(CacheHealth {
            healthy: true,
            latency: Duration::ZERO,
            details: serde_json::json!({ "provider": "noop" }),
        })
    }

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

/// Glob matching with `*` (any run) and `?` (any single character).
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();
    let (mut p, mut k) = (0usize, 0usize);
    let (mut star, mut star_k) = (None::<usize>, 0usize);
    while k < key.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == key[k]) {
            p += 1;
            k += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_k = k;
            p += 1;
        } else if let Some(star_p) = star {
            p = star_p + 1;
            star_k += 1;
            k = star_k;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
