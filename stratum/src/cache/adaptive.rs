//! Adaptive TTL decorator.
//!
//! Tracks per-key access frequency over a sliding window: hot keys store
//! with twice the base TTL, keys gone cold store with half of it. The
//! window never shrinks below one minute so a burst cannot flap the
//! classification.

use crate::cache::{CacheHealth, CacheProvider, CacheStats};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_HOT_THRESHOLD: u64 = 10;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const WINDOW_FLOOR: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCategory {
    Hot,
    Normal,
    Cold,
}

/// Per-key access summary.
#[derive(Debug, Clone)]
pub struct AccessStats {
    pub count: u64,
    pub category: AccessCategory,
}

#[derive(Debug, Clone)]
struct WindowCounter {
    count: u64,
    window_start: Instant,
    /// Set when the previous window lapsed with no access in between.
    went_cold: bool,
}

/// Wraps any provider with access-frequency-driven TTLs.
pub struct AdaptiveTtlCache {
    inner: Arc<dyn CacheProvider>,
    base_ttl: Duration,
    window: Duration,
    hot_threshold: u64,
    counters: Mutex<HashMap<String, WindowCounter>>,
}

impl AdaptiveTtlCache {
    pub fn new(inner: Arc<dyn CacheProvider>, base_ttl: Duration) -> Self {
        Self::with_tuning(inner, base_ttl, DEFAULT_WINDOW, DEFAULT_HOT_THRESHOLD)
    }

    pub fn with_tuning(
        inner: Arc<dyn CacheProvider>,
        base_ttl: Duration,
        window: Duration,
        hot_threshold: u64,
    ) -> Self {
        Self {
            inner,
            base_ttl,
            window: window.max(WINDOW_FLOOR),
            hot_threshold,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Test-only constructor that skips the window floor.
    #[cfg(test)]
    fn with_raw_window(
        inner: Arc<dyn CacheProvider>,
        base_ttl: Duration,
        window: Duration,
        hot_threshold: u64,
    ) -> Self {
        Self {
            inner,
            base_ttl,
            window,
            hot_threshold,
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn record_access(&self, key: &str) {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        match counters.get_mut(key) {
            Some(counter) => {
                if now.duration_since(counter.window_start) > self.window {
                    counter.window_start = now;
                    counter.count = 1;
                    counter.went_cold = true;
                } else {
                    counter.count += 1;
                    if counter.count >= self.hot_threshold {
                        counter.went_cold = false;
                    }
                }
            }
            None => {
                counters.insert(
                    key.to_string(),
                    WindowCounter {
                        count: 1,
                        window_start: now,
                        went_cold: false,
                    },
                );
            }
        }
    }

    fn category_of(&self, counter: &WindowCounter, now: Instant) -> AccessCategory {
        if now.duration_since(counter.window_start) > self.window {
            return AccessCategory::Cold;
        }
        if counter.count >= self.hot_threshold {
            return AccessCategory::Hot;
        }
        if counter.went_cold {
            return AccessCategory::Cold;
        }
        AccessCategory::Normal
    }

    /// Current classification of a key. Keys never accessed are `Normal`.
    pub fn access_stats(&self, key: &str) -> AccessStats {
        let counters = self.counters.lock();
        match counters.get(key) {
            Some(counter) => AccessStats {
                count: counter.count,
                category: self.category_of(counter, Instant::now()),
            },
            None => AccessStats {
                count: 0,
                category: AccessCategory::Normal,
            },
        }
    }

    fn adaptive_ttl(&self, key: &str) -> Duration {
        match self.access_stats(key).category {
            AccessCategory::Hot => self.base_ttl * 2,
            AccessCategory::Cold => (self.base_ttl / 2).max(Duration::from_secs(1)),
            AccessCategory::Normal => self.base_ttl,
        }
    }

    /// Drops counters whose window lapsed more than one extra window ago.
    pub fn prune_counters(&self) {
        let now = Instant::now();
        let horizon = self.window * 2;
        self.counters
            .lock()
            .retain(|_, counter| now.duration_since(counter.window_start) < horizon);
    }
}

#[async_trait]
impl CacheProvider for AdaptiveTtlCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.record_access(key);
        self.inner.get(key).await
    }

    /// Stores with the adaptive TTL unless the caller pins one explicitly.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.unwrap_or_else(|| self.adaptive_ttl(key));
        self.inner.set(key, value, Some(ttl)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.counters.lock().remove(key);
        self.inner.delete(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.counters.lock().clear();
        self.inner.clear().await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        for key in keys {
            self.record_access(key);
        }
        self.inner.get_many(keys).await
    }

    async fn set_many(&self, entries: Vec<(String, Value)>, ttl: Option<Duration>) -> Result<()> {
        match ttl {
            Some(ttl) => self.inner.set_many(entries, Some(ttl)).await,
            None => {
                for (key, value) in entries {
                    let ttl = self.adaptive_ttl(&key);
                    self.inner.set(&key, value, Some(ttl)).await?;
                }
                Ok(())
            }
        }
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        {
            let mut counters = self.counters.lock();
            for key in keys {
                counters.remove(key);
            }
        }
        self.inner.delete_many(keys).await
    }

    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64> {
        self.counters
            .lock()
            .retain(|key, _| !crate::cache::glob_match(pattern, key));
        self.inner.invalidate_pattern(pattern).await
    }

    async fn ping(&self) -> Result<CacheHealth> {
        self.inner.ping().await
    }

    fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}
