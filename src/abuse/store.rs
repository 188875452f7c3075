//! Persistence backends for violation records.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ledger::ViolationRecord;
use crate::error::Result;
use crate::remote::RedisHandle;

/// Storage for violation records keyed by `(identifier, endpoint)`.
///
/// Reads may be slightly stale under concurrency; window counters remain the
/// primary enforcement.
#[async_trait]
pub trait ViolationStore: Send + Sync {
    async fn load(&self, identifier: &str, endpoint: &str) -> Result<Option<ViolationRecord>>;

    /// Insert or replace the record for its pair.
    async fn save(&self, record: &ViolationRecord) -> Result<()>;

    /// Remove records not updated since `cutoff`. Returns how many were removed.
    async fn purge_stale(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// In-process violation store with retention-based purging.
#[derive(Debug)]
pub struct MemoryViolationStore {
    records: DashMap<(String, String), ViolationRecord>,
    retention: Duration,
}

impl MemoryViolationStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            records: DashMap::new(),
            retention,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }
}

#[async_trait]
impl ViolationStore for MemoryViolationStore {
    async fn load(&self, identifier: &str, endpoint: &str) -> Result<Option<ViolationRecord>> {
        let key = (identifier.to_string(), endpoint.to_string());
        Ok(self.records.get(&key).map(|r| r.value().clone()))
    }

    async fn save(&self, record: &ViolationRecord) -> Result<()> {
        let key = (record.identifier.clone(), record.endpoint.clone());
        self.records.insert(key, record.clone());
        Ok(())
    }

    async fn purge_stale(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let before = self.records.len();
        self.records.retain(|_, record| record.updated_at >= cutoff);
        Ok(before.saturating_sub(self.records.len()))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Violation store shared through Redis.
///
/// Each record is a JSON string whose key expires after the retention
/// window; every save refreshes the expiry.
pub struct RedisViolationStore {
    redis: RedisHandle,
    retention: Duration,
}

impl RedisViolationStore {
    pub fn new(redis: RedisHandle, retention: Duration) -> Self {
        Self { redis, retention }
    }

    fn key(&self, identifier: &str, endpoint: &str) -> String {
        self.redis
            .key(&format!("violation:{}:{}", identifier, endpoint))
    }
}

#[async_trait]
impl ViolationStore for RedisViolationStore {
    async fn load(&self, identifier: &str, endpoint: &str) -> Result<Option<ViolationRecord>> {
        let key = self.key(identifier, endpoint);
        let raw: Option<String> = self
            .redis
            .exec(|mut conn| async move {
                redis::cmd("GET").arg(&key).query_async(&mut conn).await
            })
            .await?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &ViolationRecord) -> Result<()> {
        let key = self.key(&record.identifier, &record.endpoint);
        let json = serde_json::to_string(record)?;
        let ttl_secs = self.retention.num_seconds().max(1);

        self.redis
            .exec(|mut conn| async move {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(json)
                    .arg("EX")
                    .arg(ttl_secs)
                    .query_async::<_, ()>(&mut conn)
                    .await
            })
            .await
    }

    async fn purge_stale(&self, _cutoff: DateTime<Utc>) -> Result<usize> {
        // Key expiry already enforces retention
        Ok(0)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Periodically purge records older than `retention`.
pub fn spawn_purger(
    store: Arc<dyn ViolationStore>,
    retention: Duration,
    every: StdDuration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match store.purge_stale(Utc::now() - retention).await {
                Ok(0) => {}
                Ok(purged) => debug!(purged = purged, "Purged stale violation records"),
                Err(e) => warn!(backend = store.name(), error = %e, "Violation purge failed"),
            }
        }
    })
}
