//! Shared Redis connection handle with bounded call latency.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::RedisResult;
use tracing::debug;

use crate::config::RedisConfig;
use crate::error::{GuardError, Result};

struct Inner {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    timeout: Duration,
    key_prefix: String,
}

/// A cloneable handle to one Redis deployment.
///
/// The multiplexed connection is established lazily and dropped after any
/// failed call so the next call reconnects. Every round trip, including the
/// connect, is bounded by the configured timeout.
#[derive(Clone)]
pub struct RedisHandle {
    inner: Arc<Inner>,
}

impl RedisHandle {
    /// Create a handle without connecting.
    pub fn new(url: &str, timeout: Duration, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                connection: Mutex::new(None),
                timeout,
                key_prefix: key_prefix.to_string(),
            }),
        })
    }

    /// Build a handle from configuration, or `None` when no URL is set.
    pub fn from_config(config: &RedisConfig) -> Result<Option<Self>> {
        config
            .url
            .as_deref()
            .map(|url| Self::new(url, config.timeout(), &config.key_prefix))
            .transpose()
    }

    /// Prefix a key with this deployment's namespace.
    pub fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.inner.key_prefix, suffix)
    }

    /// Run one operation against the shared connection.
    pub async fn exec<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let result = match self.connection().await {
            Ok(conn) => self.bounded(op(conn)).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.inner.connection.lock().take();
        }
        result
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let cached = self.inner.connection.lock().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let conn = self
            .bounded(self.inner.client.get_multiplexed_async_connection())
            .await?;
        debug!("Connected to Redis");
        *self.inner.connection.lock() = Some(conn.clone());
        Ok(conn)
    }

    async fn bounded<T>(&self, fut: impl Future<Output = RedisResult<T>>) -> Result<T> {
        match tokio::time::timeout(self.inner.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(GuardError::Timeout {
                backend: "redis",
                after_ms: self.inner.timeout.as_millis() as u64,
            }),
        }
    }
}

impl std::fmt::Debug for RedisHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisHandle")
            .field("key_prefix", &self.inner.key_prefix)
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}
