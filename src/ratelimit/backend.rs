//! Counter store trait for abstracting in-memory and distributed implementations.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Outcome of consuming one request from a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumption {
    /// Whether the request fit within the limit
    pub allowed: bool,
    /// Requests left in the current window, never negative
    pub remaining: u64,
    /// When the window frees up again
    pub reset_at: DateTime<Utc>,
}

/// Trait for sliding-window counter backends.
///
/// `consume` must be atomic per key: two concurrent calls for the same key
/// can never both observe the last free slot.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record one request against `key` if it fits within `limit` per `window`.
    async fn consume(&self, key: &str, limit: u64, window: Duration) -> Result<Consumption>;

    /// Short backend name for logs and metrics.
    fn name(&self) -> &'static str;
}
