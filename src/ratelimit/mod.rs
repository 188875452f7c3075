//! Rate limiting logic and counter state.

mod backend;
mod counter;
mod descriptor;
mod distributed;
mod limiter;
mod rules;

pub use backend::{Consumption, CounterStore};
pub use counter::MemoryCounterStore;
pub use descriptor::CounterKey;
pub use distributed::RedisCounterStore;
pub use limiter::RateLimiter;
pub use rules::{
    EndpointRule, LimitRule, PolicyScope, RateLimitConfig, RateLimitPolicy, TIER_ENDPOINT,
};

#[cfg(test)]
pub(crate) use limiter::tests::OfflineStore;
