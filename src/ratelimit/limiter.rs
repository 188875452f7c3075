//! Core rate limiter with distributed-to-local failover.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, warn};

use super::backend::{Consumption, CounterStore};
use super::counter::MemoryCounterStore;
use crate::error::Result;

/// The rate limiter that routes window consumption to a backend.
///
/// When a primary (distributed) store is configured every call goes there
/// first. Any error or timeout from the primary is logged and the same call
/// is answered by the in-process store instead, so callers never see a
/// backend failure.
pub struct RateLimiter {
    /// Distributed store, if configured
    primary: Option<Arc<dyn CounterStore>>,
    /// In-process store used alone or as fallback
    fallback: Arc<MemoryCounterStore>,
}

impl RateLimiter {
    /// Create a rate limiter that only counts in process.
    pub fn new() -> Self {
        Self::local(Arc::new(MemoryCounterStore::new()))
    }

    /// Create a rate limiter over an existing in-process store.
    pub fn local(fallback: Arc<MemoryCounterStore>) -> Self {
        Self {
            primary: None,
            fallback,
        }
    }

    /// Create a rate limiter with a distributed primary store.
    pub fn with_primary(primary: Arc<dyn CounterStore>, fallback: Arc<MemoryCounterStore>) -> Self {
        Self {
            primary: Some(primary),
            fallback,
        }
    }

    /// Consume one request for `key`.
    pub async fn consume(&self, key: &str, limit: u64, window: Duration) -> Consumption {
        if let Some(primary) = &self.primary {
            match primary.consume(key, limit, window).await {
                Ok(consumption) => return consumption,
                Err(e) => {
                    warn!(
                        backend = primary.name(),
                        key = %key,
                        error = %e,
                        "Counter backend failed, falling back to in-memory counting"
                    );
                    counter!("abuseguard_backend_fallbacks_total", "backend" => primary.name())
                        .increment(1);
                }
            }
        }

        let consumption = self.fallback.consume_now(key, limit, window);
        if !consumption.allowed {
            debug!(key = %key, limit = limit, "In-memory rate limit exceeded");
        }
        consumption
    }

    /// The in-process store.
    pub fn fallback(&self) -> &Arc<MemoryCounterStore> {
        &self.fallback
    }

    /// Whether a distributed store is configured.
    pub fn is_distributed(&self) -> bool {
        self.primary.is_some()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for RateLimiter {
    async fn consume(&self, key: &str, limit: u64, window: Duration) -> Result<Consumption> {
        Ok(RateLimiter::consume(self, key, limit, window).await)
    }

    fn name(&self) -> &'static str {
        if self.is_distributed() {
            "failover"
        } else {
            "memory"
        }
    }
}
