//! Redis-backed distributed cache provider.
//!
//! Values are JSON-encoded and transparently zstd-compressed beyond a size
//! threshold. Pattern invalidation walks SCAN; deletions are published on an
//! invalidation channel so sibling instances can drop their local copies.

use crate::cache::{CacheHealth, CacheProvider, CacheStats};
use crate::error::{Result, StratumError};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use serde_json::Value;
use std::time::{Duration, Instant};

const MARKER_RAW: u8 = 0;
const MARKER_ZSTD: u8 = 1;
const DEFAULT_COMPRESS_THRESHOLD: usize = 16 * 1024;
const ZSTD_LEVEL: i32 = 3;

fn cache_err(err: redis::RedisError) -> StratumError {
    StratumError::Cache(err.to_string())
}

/// Serializes a value, compressing payloads over the threshold. The first
/// byte tags the encoding.
pub(crate) fn encode_value(value: &Value, compress_threshold: usize) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    if json.len() > compress_threshold {
        let compressed = zstd::stream::encode_all(&json[..], ZSTD_LEVEL)?;
        let mut out = Vec::with_capacity(compressed.len() + 1);
        out.push(MARKER_ZSTD);
        out.extend_from_slice(&compressed);
        Ok(out)
    } else {
        let mut out = Vec::with_capacity(json.len() + 1);
        out.push(MARKER_RAW);
        out.extend_from_slice(&json);
        Ok(out)
    }
}

pub(crate) fn decode_value(bytes: &[u8]) -> Result<Value> {
    match bytes.split_first() {
        Some((&MARKER_RAW, rest)) => Ok(serde_json::from_slice(rest)?),
        Some((&MARKER_ZSTD, rest)) => {
            let json = zstd::stream::decode_all(rest)?;
            Ok(serde_json::from_slice(&json)?)
        }
        _ => Err(StratumError::Cache("unrecognized cache encoding".into())),
    }
}

/// Extracts a few interesting fields from a raw INFO dump.
pub(crate) fn parse_info(info: &str) -> Value {
    let mut version = None;
    let mut used_memory = None;
    let mut connected_clients = None;
    for line in info.lines() {
        if let Some((key, value)) = line.split_once(':') {
            match key {
                "redis_version" => version = Some(value.trim().to_string()),
                "used_memory" => used_memory = value.trim().parse::<u64>().ok(),
                "connected_clients" => connected_clients = value.trim().parse::<u64>().ok(),
                _ => {}
            }
        }
    }
    serde_json::json!({
        "provider": "redis",
        "version": version,
        "used_memory": used_memory,
        "connected_clients": connected_clients,
    })
}

/// Distributed KV cache over a Redis connection.
pub struct RedisCache {
    client: redis::Client,
    conn: ConnectionManager,
    invalidation_channel: String,
    compress_threshold: usize,
    stats: Mutex<CacheStats>,
}

impl RedisCache {
    pub async fn connect(url: &str, invalidation_channel: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).map_err(cache_err)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(cache_err)?;
        Ok(Self {
            client,
            conn,
            invalidation_channel: invalidation_channel.into(),
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            stats: Mutex::new(CacheStats::default()),
        })
    }

    pub fn with_compress_threshold(mut self, threshold: usize) -> Self {
        self.compress_threshold = threshold;
        self
    }

    pub fn invalidation_channel(&self) -> &str {
        &self.invalidation_channel
    }

    async fn publish_invalidation(&self, key: &str) {
        let mut conn = self.conn.clone();
        let result: std::result::Result<(), redis::RedisError> = redis::cmd("PUBLISH")
            .arg(&self.invalidation_channel)
            .arg(key)
            .query_async(&mut conn)
            .await;
        if let Err(err) = result {
            log::warn!("cache: failed to publish invalidation for '{}': {}", key, err);
        }
    }

    /// Subscribes to the invalidation channel and invokes the callback for
    /// every published key. Runs until the returned handle is aborted.
    pub fn listen_invalidations<F>(&self, callback: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let client = self.client.clone();
        let channel = self.invalidation_channel.clone();
        tokio::spawn(async move {
            let Ok(mut pubsub) = client.get_async_pubsub().await else {
                log::error!("cache: pub/sub connection failed");
                return;
            };
            if let Err(err) = pubsub.subscribe(&channel).await {
                log::error!("cache: subscribing to '{}' failed: {}", channel, err);
                return;
            }
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                if let Ok(key) = message.get_payload::<String>() {
                    callback(key);
                }
            }
        })
    }
}

#[async_trait]
impl CacheProvider for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;
        match bytes {
            Some(bytes) => {
                self.stats.lock().hits += 1;
                Ok(Some(decode_value(&bytes)?))
            }
            None => {
                self.stats.lock().misses += 1;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let bytes = encode_value(&value, self.compress_threshold)?;
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(bytes);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(cache_err)?;
        self.stats.lock().sets += 1;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;
        if removed > 0 {
            self.stats.lock().deletes += 1;
            self.publish_invalidation(key).await;
        }
        Ok(removed > 0)
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;
        self.publish_invalidation("*").await;
        Ok(())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let rows: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;
        let mut out = Vec::with_capacity(rows.len());
        let mut stats = self.stats.lock();
        for row in rows {
            match row {
                Some(bytes) => {
                    stats.hits += 1;
                    out.push(Some(decode_value(&bytes)?));
                }
                None => {
                    stats.misses += 1;
                    out.push(None);
                }
            }
        }
        Ok(out)
    }

    async fn set_many(&self, entries: Vec<(String, Value)>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for (key, value) in &entries {
            let bytes = encode_value(value, self.compress_threshold)?;
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(bytes);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis() as u64);
            }
            pipe.add_command(cmd);
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(cache_err)?;
        self.stats.lock().sets += entries.len() as u64;
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;
        self.stats.lock().deletes += removed as u64;
        for key in keys {
            self.publish_invalidation(key).await;
        }
        Ok(removed as u64)
    }

    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(cache_err)?;
            if !keys.is_empty() {
                let batch: i64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(cache_err)?;
                removed += batch as u64;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        self.stats.lock().deletes += removed;
        self.publish_invalidation(pattern).await;
        Ok(removed)
    }

    async fn ping(&self) -> Result<CacheHealth> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let pong: std::result::Result<String, redis::RedisError> =
            redis::cmd("PING").query_async(&mut conn).await;
        let latency = started.elapsed();
        match pong {
            Ok(_) => {
                let info: String = redis::cmd("INFO")
                    .query_async(&mut conn)
                    .await
                    .map_err(cache_err)?;
                Ok(CacheHealth {
                    healthy: true,
                    latency,
                    details: parse_info(&info),
                })
            }
            Err(err) => Ok(CacheHealth {
                healthy: false,
                latency,
                details: serde_json::json!({ "provider": "redis", "error": err.to_string() }),
            }),
        }
    }

    fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }
}
