//! Advisory-lock mutual exclusion across process instances.
//!
//! Lock keys pack a 32-bit namespace prefix above the FNV-1a hash of the
//! task id. Locks are session-scoped: they live on one dedicated connection
//! and vanish with it, so callers re-acquire on every task invocation.

use crate::config::LockConfig;
use crate::error::Result;
use parking_lot::Mutex;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// FNV-1a over the UTF-8 bytes of the input.
pub fn fnv1a32(input: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in input.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// 64-bit advisory key: namespace prefix in the high half, task hash in the
/// low half.
pub fn lock_key(prefix: u32, task_id: &str) -> i64 {
    (((prefix as u64) << 32) | fnv1a32(task_id) as u64) as i64
}

/// Session-scoped advisory lock service.
pub struct DistributedLock {
    pool: PgPool,
    config: LockConfig,
    /// The dedicated session connection all lock calls go through.
    conn: tokio::sync::Mutex<Option<PoolConnection<Postgres>>>,
    held: Mutex<HashSet<String>>,
}

impl DistributedLock {
    pub fn new(pool: PgPool, config: LockConfig) -> Self {
        Self {
            pool,
            config,
            conn: tokio::sync::Mutex::new(None),
            held: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Task ids currently tracked as held by this instance.
    pub fn held(&self) -> Vec<String> {
        self.held.lock().iter().cloned().collect()
    }

    /// Attempts to take the lock for a task id. With `lock_timeout_ms > 0`
    /// the attempt is retried every `retry_interval_ms` until the timeout
    /// elapses; otherwise it is a single non-blocking try.
    pub async fn try_acquire(&self, task_id: &str) -> Result<bool> {
        if !self.config.enabled {
            return Ok(true);
        }
        let key = lock_key(self.config.lock_key_prefix, task_id);
        let deadline = Instant::now() + Duration::from_millis(self.config.lock_timeout_ms);
        loop {
            if self.try_once(key).await? {
                self.held.lock().insert(task_id.to_string());
                if self.config.enable_logging {
                    log::debug!("lock: acquired {} (key {})", task_id, key);
                }
                return Ok(true);
            }
            if self.config.lock_timeout_ms == 0 || Instant::now() >= deadline {
                if self.config.enable_logging {
                    log::debug!("lock: missed {} (key {})", task_id, key);
                }
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(self.config.retry_interval_ms)).await;
        }
    }

    async fn try_once(&self, key: i64) -> Result<bool> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.pool.acquire().await?);
        }
        let conn = guard.as_mut().unwrap();
        match sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(conn.as_mut())
            .await
        {
            Ok(acquired) => Ok(acquired),
            Err(err) => {
                // The session is gone, and with it every lock it carried.
                *guard = None;
                self.held.lock().clear();
                Err(err.into())
            }
        }
    }

    /// Releases the lock for a task id. The id is untracked even when the
    /// database reports the lock as not held (e.g. after a recycled
    /// connection).
    pub async fn release(&self, task_id: &str) -> Result<bool> {
        if !self.config.enabled {
            return Ok(true);
        }
        let key = lock_key(self.config.lock_key_prefix, task_id);
        self.held.lock().remove(task_id);
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Ok(false);
        };
        match sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(conn.as_mut())
            .await
        {
            Ok(released) => {
                if !released {
                    log::warn!("lock: {} was not held at release", task_id);
                }
                Ok(released)
            }
            Err(err) => {
                *guard = None;
                self.held.lock().clear();
                Err(err.into())
            }
        }
    }

    /// Releases every tracked lock; used at shutdown.
    pub async fn release_all(&self) -> Result<()> {
        let ids: Vec<String> = {
            let mut held = self.held.lock();
            held.drain().collect()
        };
        for task_id in ids {
            let key = lock_key(self.config.lock_key_prefix, &task_id);
            let mut guard = self.conn.lock().await;
            if let Some(conn) = guard.as_mut() {
                if let Err(err) = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
                    .bind(key)
                    .fetch_one(conn.as_mut())
                    .await
                {
                    log::warn!("lock: release_all failed for {}: {}", task_id, err);
                    *guard = None;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fnv1a32_known_vectors() {
        assert_eq!(fnv1a32(""), 0x811c_9dc5);
        assert_eq!(fnv1a32("a"), 0xe40c_292c);
        assert_eq!(fnv1a32("foobar"), 0xbf9c_f968);
    }

    #[test]
    fn lock_key_packs_prefix_into_high_bits() {
        let prefix = 0x4255_4E53;
        let key = lock_key(prefix, "cleanup-task");
        assert_eq!((key as u64 >> 32) as u32, prefix);
        assert_eq!(key as u32, fnv1a32("cleanup-task"));
        assert!(key > 0);
    }

    #[test]
    fn lock_key_is_deterministic_and_distinct_per_task() {
        let prefix = 0x4255_4E53;
        assert_eq!(lock_key(prefix, "t1"), lock_key(prefix, "t1"));
        assert_ne!(lock_key(prefix, "t1"), lock_key(prefix, "t2"));
        assert_ne!(lock_key(prefix, "t1"), lock_key(prefix + 1, "t1"));
    }
}
