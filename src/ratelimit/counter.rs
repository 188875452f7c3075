//! In-process counter store used as the fallback backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backend::{Consumption, CounterStore};
use crate::error::Result;

/// A fixed window that starts at the first request for a key.
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u64,
    reset_at: Instant,
}

impl WindowCounter {
    fn fresh(now: Instant, window: Duration) -> Self {
        Self {
            count: 0,
            reset_at: now + window,
        }
    }
}

/// Counter store backed by a concurrent map.
///
/// Entries are reset lazily when touched after their window ends and are
/// evicted by [`MemoryCounterStore::sweep`]. State is per process only.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, WindowCounter>,
}

impl MemoryCounterStore {
    /// Create a new, empty counter store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous consume; the map entry lock makes it atomic per key.
    pub fn consume_now(&self, key: &str, limit: u64, window: Duration) -> Consumption {
        let now = Instant::now();
        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| WindowCounter::fresh(now, window));

        if counter.reset_at <= now {
            *counter = WindowCounter::fresh(now, window);
        }

        let allowed = counter.count < limit;
        if allowed {
            counter.count += 1;
        }

        let until_reset = counter.reset_at.saturating_duration_since(now);
        let consumption = Consumption {
            allowed,
            remaining: limit.saturating_sub(counter.count),
            reset_at: Utc::now()
                + chrono::Duration::from_std(until_reset).unwrap_or_else(|_| chrono::Duration::zero()),
        };

        trace!(
            key = %key,
            count = counter.count,
            limit = limit,
            allowed = allowed,
            "In-memory window consumed"
        );

        consumption
    }

    /// Drop every entry whose window has ended. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| counter.reset_at > now);
        before.saturating_sub(self.counters.len())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.counters.clear();
    }

    /// Run [`sweep`](Self::sweep) on a fixed interval until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let evicted = store.sweep();
                if evicted > 0 {
                    debug!(evicted = evicted, live = store.len(), "Swept expired counters");
                }
            }
        })
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn consume(&self, key: &str, limit: u64, window: Duration) -> Result<Consumption> {
        Ok(self.consume_now(key, limit, window))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(900);

    #[tokio::test]
    async fn test_consume_within_limit() {
        let store = MemoryCounterStore::new();

        let first = store.consume_now("k", 10, WINDOW);
        assert!(first.allowed);
        assert_eq!(first.remaining, 9);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_consume_exceeds_limit() {
        let store = MemoryCounterStore::new();

        let remaining: Vec<u64> = (0..5)
            .map(|_| store.consume_now("k", 5, WINDOW))
            .inspect(|c| assert!(c.allowed))
            .map(|c| c.remaining)
            .collect();
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        // The 6th request should be rejected
        let sixth = store.consume_now("k", 5, WINDOW);
        assert!(!sixth.allowed);
        assert_eq!(sixth.remaining, 0);
    }

    #[tokio::test]
    async fn test_reset_time_is_window_end() {
        let store = MemoryCounterStore::new();
        let before = Utc::now();

        let consumption = store.consume_now("k", 1, WINDOW);
        let secs = (consumption.reset_at - before).num_seconds();
        assert!((898..=900).contains(&secs), "reset in {}s", secs);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_expiry() {
        let store = MemoryCounterStore::new();
        let window = Duration::from_secs(60);

        for _ in 0..3 {
            store.consume_now("k", 3, window);
        }
        assert!(!store.consume_now("k", 3, window).allowed);

        tokio::time::advance(Duration::from_secs(61)).await;

        let after = store.consume_now("k", 3, window);
        assert!(after.allowed);
        assert_eq!(after.remaining, 2);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let store = MemoryCounterStore::new();

        assert!(store.consume_now("a", 1, WINDOW).allowed);
        assert!(!store.consume_now("a", 1, WINDOW).allowed);
        assert!(store.consume_now("b", 1, WINDOW).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_expired() {
        let store = MemoryCounterStore::new();
        store.consume_now("short", 5, Duration::from_secs(1));
        store.consume_now("long", 5, Duration::from_secs(300));

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_runs() {
        let store = Arc::new(MemoryCounterStore::new());
        store.consume_now("k", 5, Duration::from_secs(1));

        let handle = store.spawn_sweeper(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert!(store.is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn test_concurrent_consumers_never_exceed_limit() {
        let store = Arc::new(MemoryCounterStore::new());

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.consume("shared", 20, WINDOW).await })
            })
            .collect();

        let mut allowed = 0;
        for result in futures::future::join_all(tasks).await {
            if result.unwrap().unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 20);
    }

    #[tokio::test]
    async fn test_clear_counters() {
        let store = MemoryCounterStore::new();
        store.consume_now("k", 1, WINDOW);
        store.clear();
        assert!(store.is_empty());
        assert!(store.consume_now("k", 1, WINDOW).allowed);
    }
}
