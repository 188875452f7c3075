//! Distributed sliding-window counter backed by Redis sorted sets.
//!
//! Each key holds one sorted-set member per admitted request, scored by its
//! arrival time in milliseconds. A Lua script performs evict, count, insert
//! and expire as a single atomic step on the server.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use tracing::trace;

use super::backend::{Consumption, CounterStore};
use crate::error::Result;
use crate::remote::RedisHandle;

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)

if count < limit then
    redis.call('ZADD', key, now, ARGV[4])
    redis.call('PEXPIRE', key, window)
    return {1, limit - count - 1, window}
end

return {0, 0, redis.call('PTTL', key)}
"#;

/// Counter store shared by every process pointing at the same Redis.
pub struct RedisCounterStore {
    redis: RedisHandle,
    script: Script,
}

impl RedisCounterStore {
    pub fn new(redis: RedisHandle) -> Self {
        Self {
            redis,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
        }
    }
}

/// Turn the script's `[allowed, remaining, ttl_ms]` reply into a consumption.
fn interpret(reply: &[i64], window: Duration, now: DateTime<Utc>) -> Consumption {
    let window_ms = window.as_millis() as i64;
    let allowed = reply.first().copied() == Some(1);
    let remaining = reply.get(1).copied().unwrap_or(0).max(0) as u64;
    // PTTL answers -1/-2 when the key has no expiry or vanished mid-call
    let ttl_ms = match reply.get(2).copied() {
        Some(ttl) if ttl > 0 => ttl,
        _ => window_ms,
    };

    Consumption {
        allowed,
        remaining,
        reset_at: now + chrono::Duration::milliseconds(ttl_ms),
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn consume(&self, key: &str, limit: u64, window: Duration) -> Result<Consumption> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());

        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(self.redis.key(key))
            .arg(now_ms)
            .arg(window.as_millis() as u64)
            .arg(limit)
            .arg(member);

        let reply: Vec<i64> = self
            .redis
            .exec(|mut conn| async move { invocation.invoke_async(&mut conn).await })
            .await?;

        let consumption = interpret(&reply, window, now);
        trace!(
            key = %key,
            allowed = consumption.allowed,
            remaining = consumption.remaining,
            "Redis window consumed"
        );
        Ok(consumption)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
