//! Rate limit policy configuration and matching.
//!
//! Policies come from an ordered table of endpoint prefixes plus two global
//! tiers for anonymous and authenticated callers. Matching is a pure function
//! of the request: the first endpoint prefix that matches wins, then the
//! caller's authentication state picks the tier.
//!
//! A resolved policy also names the endpoint it governs. Counters and
//! violation records are keyed by that endpoint, never by the raw path, so
//! every path under one prefix shares a single budget.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GuardError, Result};
use crate::request::RequestMeta;

/// Which part of the table a resolved policy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyScope {
    Anonymous,
    Authenticated,
    Endpoint,
}

/// Endpoint key shared by every request that falls through to a tier.
pub const TIER_ENDPOINT: &str = "*";

/// A resolved, immutable rate limit policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Matched endpoint prefix, or [`TIER_ENDPOINT`] for the global tiers
    pub endpoint: String,
    /// Length of the sliding window in seconds
    pub window_secs: u64,
    /// Requests allowed per window
    pub max_requests: u64,
    /// Where this policy came from
    pub scope: PolicyScope,
}

impl RateLimitPolicy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// A limit/window pair as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Requests allowed per window
    pub max_requests: u64,
    /// Window length in seconds
    pub window_secs: u64,
}

impl LimitRule {
    pub const fn new(max_requests: u64, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    fn policy(&self, scope: PolicyScope, endpoint: &str) -> RateLimitPolicy {
        RateLimitPolicy {
            endpoint: endpoint.to_string(),
            window_secs: self.window_secs,
            max_requests: self.max_requests,
            scope,
        }
    }

    fn validate(&self, what: &str) -> Result<()> {
        if self.max_requests == 0 {
            return Err(GuardError::Config(format!(
                "{}: max_requests must be positive",
                what
            )));
        }
        if self.window_secs == 0 {
            return Err(GuardError::Config(format!(
                "{}: window_secs must be positive",
                what
            )));
        }
        Ok(())
    }
}

/// An endpoint-specific policy keyed by route prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRule {
    /// Route prefix, e.g. `/api/auth`
    pub prefix: String,
    /// Requests allowed per window
    pub max_requests: u64,
    /// Window length in seconds
    pub window_secs: u64,
}

impl EndpointRule {
    /// Create a new endpoint rule.
    pub fn new(prefix: &str, max_requests: u64, window_secs: u64) -> Self {
        Self {
            prefix: prefix.to_string(),
            max_requests,
            window_secs,
        }
    }

    /// The prefix itself or anything below it, on segment boundaries.
    fn matches(&self, path: &str) -> bool {
        path == self.prefix
            || path
                .strip_prefix(self.prefix.trim_end_matches('/'))
                .is_some_and(|rest| rest.starts_with('/'))
    }

    fn limit(&self) -> LimitRule {
        LimitRule::new(self.max_requests, self.window_secs)
    }
}

/// The complete policy table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Endpoint policies, most specific first
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<EndpointRule>,
    /// Tier for callers without a verified identity
    #[serde(default = "default_anonymous")]
    pub anonymous: LimitRule,
    /// Tier for callers with a verified identity
    #[serde(default = "default_authenticated")]
    pub authenticated: LimitRule,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            anonymous: default_anonymous(),
            authenticated: default_authenticated(),
        }
    }
}

fn default_endpoints() -> Vec<EndpointRule> {
    vec![
        EndpointRule::new("/api/auth", 5, 15 * 60),
        EndpointRule::new("/api/bookings", 20, 15 * 60),
        EndpointRule::new("/api/export", 3, 60 * 60),
    ]
}

fn default_anonymous() -> LimitRule {
    LimitRule::new(100, 15 * 60)
}

fn default_authenticated() -> LimitRule {
    LimitRule::new(500, 15 * 60)
}

impl RateLimitConfig {
    /// Reject tables that could never admit a request.
    pub fn validate(&self) -> Result<()> {
        self.anonymous.validate("anonymous")?;
        self.authenticated.validate("authenticated")?;
        for rule in &self.endpoints {
            if !rule.prefix.starts_with('/') {
                return Err(GuardError::Config(format!(
                    "endpoint prefix {:?} must start with '/'",
                    rule.prefix
                )));
            }
            rule.limit().validate(&rule.prefix)?;
        }
        Ok(())
    }

    /// Find the first endpoint rule whose prefix matches the path.
    pub fn find_endpoint(&self, path: &str) -> Option<&EndpointRule> {
        self.endpoints.iter().find(|rule| rule.matches(path))
    }

    /// Resolve the policy governing a request.
    pub fn resolve(&self, request: &RequestMeta) -> RateLimitPolicy {
        if let Some(rule) = self.find_endpoint(&request.path) {
            return rule.limit().policy(PolicyScope::Endpoint, &rule.prefix);
        }
        if request.is_authenticated() {
            self.authenticated
                .policy(PolicyScope::Authenticated, TIER_ENDPOINT)
        } else {
            self.anonymous.policy(PolicyScope::Anonymous, TIER_ENDPOINT)
        }
    }
}
