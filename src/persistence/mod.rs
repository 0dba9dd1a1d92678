use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::Result;

/// A cached market-data value with the time it was stored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedEntry {
    pub value: serde_json::Value,
    pub stored_at: DateTime<Utc>,
}

/// How usable a cached entry is right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Within TTL, serve without a live fetch
    Fresh,
    /// Past TTL but inside the stale window; only a fallback
    Stale,
    Expired,
}

impl CachedEntry {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            stored_at: Utc::now(),
        }
    }

    pub fn freshness(&self, now: DateTime<Utc>, ttl: Duration, stale_max: Duration) -> Freshness {
        let age = now - self.stored_at;
        if age <= ttl {
            Freshness::Fresh
        } else if age <= stale_max {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

/// Key/value store for market-data snapshots
///
/// Races are tolerated: last writer wins.
#[async_trait]
pub trait SnapshotCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedEntry>>;
    async fn set(&self, key: &str, entry: &CachedEntry) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-process cache, used when Redis is not configured
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CachedEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CachedEntry>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, entry: &CachedEntry) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Redis-backed snapshot cache
///
/// Entries are JSON strings under `spotguard:cache:{key}` and expire on the
/// Redis side once they can no longer serve as a stale fallback.
pub struct RedisCache {
    conn: ConnectionManager,
    retention_secs: u64,
}

impl RedisCache {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `retention_secs` - Lifetime of a stored entry (the stale window)
    pub async fn new(redis_url: &str, retention_secs: u64) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(std::time::Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| {
                redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "Redis connection timeout after 5 seconds",
                ))
            })??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            retention_secs: retention_secs.max(1),
        })
    }

    fn key(key: &str) -> String {
        format!("spotguard:cache:{}", key)
    }
}

#[async_trait]
impl SnapshotCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<CachedEntry>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::key(key)).await?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, entry: &CachedEntry) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(entry)?;

        conn.set_ex::<_, _, ()>(Self::key(key), json, self.retention_secs)
            .await?;

        tracing::debug!("Cached {} in Redis", key);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::key(key)).await?;
        Ok(())
    }
}
