//! The per-request gate.
//!
//! Checks run cheapest first and short-circuit:
//! whitelist, payload size, active ban, window counter. Pattern detection and
//! penalties only run once a request has already been rejected by its window.
//!
//! Counters and violation records are keyed by identifier and the endpoint of
//! the governing policy: the matched route prefix, or one shared tier key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::response::{self, Quota};
use crate::abuse::{
    spawn_purger, MemoryViolationStore, PatternDetector, RedisViolationStore, ViolationLedger,
    ViolationRecord,
};
use crate::config::{GuardConfig, MaintenanceConfig, WhitelistConfig};
use crate::error::Result;
use crate::identity::IdentifierResolver;
use crate::ratelimit::{
    CounterKey, CounterStore, MemoryCounterStore, RateLimitConfig, RateLimiter, RedisCounterStore,
};
use crate::remote::RedisHandle;
use crate::request::RequestMeta;

/// Decision for one request.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// Whitelisted or bypassed; no headers
    Bypass,
    /// Within limits
    Allow { quota: Quota },
    /// Declared body over the ceiling
    PayloadTooLarge { declared: u64, max: u64, limit: u64 },
    /// Actor is serving a ban
    Banned { limit: u64, record: ViolationRecord },
    /// Window exhausted; `record` is `None` if the ledger was unreachable
    Limited {
        quota: Quota,
        window_secs: u64,
        record: Option<ViolationRecord>,
    },
    /// Anonymous caller with no client address; let through uncounted
    Unidentified,
    /// Internal fault; the request is let through
    FailOpen,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(
            self,
            Verdict::Bypass | Verdict::Allow { .. } | Verdict::Unidentified | Verdict::FailOpen
        )
    }

    /// Label for metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            Verdict::Bypass => "bypass",
            Verdict::Allow { .. } => "allow",
            Verdict::PayloadTooLarge { .. } => "payload_too_large",
            Verdict::Banned { .. } => "banned",
            Verdict::Limited { .. } => "limited",
            Verdict::Unidentified => "unidentified",
            Verdict::FailOpen => "fail_open",
        }
    }
}

/// Orchestrates resolvers, counters, detector and ledger for each request.
pub struct Gate {
    whitelist: WhitelistConfig,
    bypass: bool,
    policies: RateLimitConfig,
    identifiers: IdentifierResolver,
    limiter: Arc<RateLimiter>,
    detector: PatternDetector,
    ledger: ViolationLedger,
    maintenance: MaintenanceConfig,
    retention: chrono::Duration,
    warned_unidentified: AtomicBool,
}

impl Gate {
    /// Assemble a gate from already constructed parts.
    pub fn new(
        config: &GuardConfig,
        limiter: Arc<RateLimiter>,
        detector: PatternDetector,
        ledger: ViolationLedger,
    ) -> Self {
        Self {
            whitelist: config.whitelist.clone(),
            bypass: config.bypass,
            policies: config.limits.clone(),
            identifiers: IdentifierResolver::new(config.proxy),
            limiter,
            detector,
            ledger,
            maintenance: config.maintenance.clone(),
            retention: config.ledger.retention(),
            warned_unidentified: AtomicBool::new(false),
        }
    }

    /// A gate whose state lives entirely in this process.
    pub fn in_memory(config: &GuardConfig) -> Self {
        let counters = Arc::new(MemoryCounterStore::new());
        let detector = PatternDetector::new(counters.clone(), &config.detector);
        let ledger = ViolationLedger::new(Arc::new(MemoryViolationStore::new(
            config.ledger.retention(),
        )));
        Self::new(config, Arc::new(RateLimiter::local(counters)), detector, ledger)
    }

    /// Build the gate described by `config`, using Redis when a URL is set.
    pub fn from_config(config: &GuardConfig) -> Result<Self> {
        config.validate()?;
        let Some(redis) = RedisHandle::from_config(&config.redis)? else {
            info!("No Redis URL configured, counting in memory");
            return Ok(Self::in_memory(config));
        };

        info!(redis = ?redis, "Using Redis for counters and violation records");
        let primary: Arc<dyn CounterStore> = Arc::new(RedisCounterStore::new(redis.clone()));
        let limiter = RateLimiter::with_primary(primary.clone(), Arc::new(MemoryCounterStore::new()));
        let detector = PatternDetector::new(primary, &config.detector);
        let ledger = ViolationLedger::new(Arc::new(RedisViolationStore::new(
            redis,
            config.ledger.retention(),
        )));
        Ok(Self::new(config, Arc::new(limiter), detector, ledger))
    }

    /// The violation ledger, for administrative lookups and overrides.
    pub fn ledger(&self) -> &ViolationLedger {
        &self.ledger
    }

    /// The window counter in front of the stores.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Start the counter sweep and the ledger purge.
    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.limiter
                .fallback()
                .spawn_sweeper(Duration::from_secs(self.maintenance.counter_sweep_secs)),
            spawn_purger(
                Arc::clone(self.ledger.store()),
                self.retention,
                Duration::from_secs(self.maintenance.ledger_purge_secs),
            ),
        ]
    }

    /// Exempt from every check.
    pub fn is_whitelisted(&self, request: &RequestMeta) -> bool {
        self.bypass
            || self.whitelist.contains_path(&request.path)
            || self
                .identifiers
                .client_addr(request)
                .is_some_and(|addr| self.whitelist.contains_addr(&addr))
    }

    /// Evaluate a request, letting it through on any internal fault.
    pub async fn check(&self, request: &RequestMeta) -> Verdict {
        match self.evaluate(request).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(path = %request.path, error = %e, "Rate limiting failed, allowing request");
                Verdict::FailOpen
            }
        }
    }

    /// Run the full decision sequence for a request.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn evaluate(&self, request: &RequestMeta) -> Result<Verdict> {
        if self.is_whitelisted(request) {
            return Ok(Verdict::Bypass);
        }

        let policy = self.policies.resolve(request);
        let endpoint = policy.endpoint.as_str();

        if self.detector.is_large_payload(request) {
            return Ok(Verdict::PayloadTooLarge {
                declared: request.content_length.unwrap_or_default(),
                max: self.detector.max_payload_bytes(),
                limit: policy.max_requests,
            });
        }

        let Some(identifier) = self.identifiers.resolve(request) else {
            if !self.warned_unidentified.swap(true, Ordering::Relaxed) {
                warn!(
                    path = %request.path,
                    "No client address on request, anonymous traffic is not rate limited; \
                     serve with into_make_service_with_connect_info::<SocketAddr>()"
                );
            }
            return Ok(Verdict::Unidentified);
        };

        match self.ledger.check_ban(identifier.as_str(), endpoint).await {
            Ok(Some(record)) => {
                debug!(identifier = %identifier, "Rejecting banned actor");
                return Ok(Verdict::Banned {
                    limit: policy.max_requests,
                    record,
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Ban check unavailable, skipping");
            }
        }

        let key = CounterKey::window(&identifier, endpoint);
        let consumption = self
            .limiter
            .consume(&key.to_string_key(), policy.max_requests, policy.window())
            .await;
        let quota = Quota {
            limit: policy.max_requests,
            remaining: consumption.remaining,
            reset_at: consumption.reset_at,
        };

        if consumption.allowed {
            return Ok(Verdict::Allow { quota });
        }

        let patterns = self.detector.detect(request, &identifier).await;
        let record = match self
            .ledger
            .record_violation(&identifier, endpoint, request, patterns)
            .await
        {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Could not record violation");
                None
            }
        };

        Ok(Verdict::Limited {
            quota,
            window_secs: policy.window_secs,
            record,
        })
    }
}

/// Axum middleware: install with `axum::middleware::from_fn_with_state`.
///
/// Anonymous callers are identified by their address, so the server must be
/// run with `into_make_service_with_connect_info::<SocketAddr>()` (or sit
/// behind a trusted proxy setting `X-Forwarded-For`). Without an address
/// anonymous requests pass through uncounted.
pub async fn enforce(State(gate): State<Arc<Gate>>, request: Request, next: Next) -> Response {
    let meta = RequestMeta::from_request(&request);
    let verdict = gate.check(&meta).await;
    counter!("abuseguard_requests_total", "outcome" => verdict.outcome()).increment(1);

    let now = Utc::now();
    match verdict {
        Verdict::Bypass | Verdict::Unidentified | Verdict::FailOpen => next.run(request).await,
        Verdict::Allow { quota } => {
            let mut response = next.run(request).await;
            quota.apply(response.headers_mut());
            response
        }
        Verdict::PayloadTooLarge {
            declared,
            max,
            limit,
        } => response::payload_too_large(declared, max, limit),
        Verdict::Banned { limit, record } => response::banned(limit, &record, now),
        Verdict::Limited {
            quota,
            window_secs,
            record,
        } => response::limited(&quota, window_secs, record.as_ref(), now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abuse::PenaltyLevel;
    use crate::ratelimit::{LimitRule, OfflineStore, PolicyScope, TIER_ENDPOINT};

    fn login(addr: &str) -> RequestMeta {
        RequestMeta::new("POST", "/api/auth/login")
            .with_peer(addr.parse().unwrap())
            .with_user_agent("Mozilla/5.0")
    }

    #[tokio::test]
    async fn test_window_cap() {
        let gate = Gate::in_memory(&GuardConfig::default());
        let request = login("203.0.113.5");

        let mut remaining = Vec::new();
        for _ in 0..5 {
            match gate.evaluate(&request).await.unwrap() {
                Verdict::Allow { quota } => {
                    assert_eq!(quota.limit, 5);
                    remaining.push(quota.remaining);
                }
                other => panic!("expected allow, got {:?}", other),
            }
        }
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        match gate.evaluate(&request).await.unwrap() {
            Verdict::Limited {
                quota,
                window_secs,
                record: Some(record),
            } => {
                assert_eq!(quota.remaining, 0);
                assert_eq!(window_secs, 900);
                assert_eq!(record.violation_count, 1);
                assert_eq!(record.penalty_level, PenaltyLevel::Warning);
                assert!(!record.is_banned);
            }
            other => panic!("expected limited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_violation_bans_and_ban_takes_precedence() {
        let gate = Gate::in_memory(&GuardConfig::default());
        let request = login("203.0.113.5");

        for _ in 0..6 {
            gate.evaluate(&request).await.unwrap();
        }

        let before = Utc::now();
        let record = match gate.evaluate(&request).await.unwrap() {
            Verdict::Limited {
                record: Some(record),
                ..
            } => record,
            other => panic!("expected limited, got {:?}", other),
        };
        assert_eq!(record.violation_count, 2);
        assert_eq!(record.penalty_level, PenaltyLevel::ShortBan);
        assert!(record.is_banned);
        let ban_secs = (record.ban_expires_at.unwrap() - before).num_seconds();
        assert!((299..=301).contains(&ban_secs), "ban of {}s", ban_secs);

        // Banned actors are rejected before counting and add no violations
        for _ in 0..3 {
            match gate.evaluate(&request).await.unwrap() {
                Verdict::Banned { record, limit } => {
                    assert_eq!(limit, 5);
                    assert_eq!(record.violation_count, 2);
                }
                other => panic!("expected banned, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_ban_applies_even_with_quota_left() {
        let gate = Gate::in_memory(&GuardConfig::default());
        gate.ledger()
            .ban_permanently("ip:203.0.113.5", "/api/auth", "manual")
            .await
            .unwrap();

        let verdict = gate.evaluate(&login("203.0.113.5")).await.unwrap();
        assert!(matches!(verdict, Verdict::Banned { .. }));
        assert!(gate.limiter().fallback().is_empty());
    }

    #[tokio::test]
    async fn test_identifier_isolation() {
        let gate = Gate::in_memory(&GuardConfig::default());

        for _ in 0..6 {
            gate.evaluate(&login("203.0.113.5")).await.unwrap();
        }
        assert!(!gate.evaluate(&login("203.0.113.5")).await.unwrap().is_allowed());

        let other = gate.evaluate(&login("198.51.100.7")).await.unwrap();
        match other {
            Verdict::Allow { quota } => assert_eq!(quota.remaining, 4),
            other => panic!("expected allow, got {:?}", other),
        }
        assert!(gate
            .ledger()
            .get("ip:198.51.100.7", "/api/auth")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_endpoint_isolation() {
        let gate = Gate::in_memory(&GuardConfig::default());
        for _ in 0..6 {
            gate.evaluate(&login("203.0.113.5")).await.unwrap();
        }

        let tours = RequestMeta::new("GET", "/api/tours")
            .with_peer("203.0.113.5".parse().unwrap())
            .with_user_agent("Mozilla/5.0");
        match gate.evaluate(&tours).await.unwrap() {
            Verdict::Allow { quota } => {
                assert_eq!(quota.limit, 100);
                assert_eq!(quota.remaining, 99);
            }
            other => panic!("expected allow, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_authenticated_callers_keyed_by_user() {
        let gate = Gate::in_memory(&GuardConfig::default());
        let request = RequestMeta::new("GET", "/api/tours")
            .with_peer("10.0.0.1".parse().unwrap())
            .with_user("alice");

        match gate.evaluate(&request).await.unwrap() {
            Verdict::Allow { quota } => assert_eq!(quota.limit, 500),
            other => panic!("expected allow, got {:?}", other),
        }

        // Same NAT address, different user: separate budget
        let bob = RequestMeta::new("GET", "/api/tours")
            .with_peer("10.0.0.1".parse().unwrap())
            .with_user("bob");
        match gate.evaluate(&bob).await.unwrap() {
            Verdict::Allow { quota } => assert_eq!(quota.remaining, 499),
            other => panic!("expected allow, got {:?}", other),
        }
        assert_eq!(
            GuardConfig::default().limits.resolve(&bob).scope,
            PolicyScope::Authenticated
        );
    }

    #[tokio::test]
    async fn test_whitelist_bypass() {
        let mut config = GuardConfig::default();
        config.whitelist.addresses = vec!["10.0.0.5".parse().unwrap()];
        let gate = Gate::in_memory(&config);

        for _ in 0..20 {
            assert!(matches!(
                gate.evaluate(&login("10.0.0.5")).await.unwrap(),
                Verdict::Bypass
            ));
            let health = RequestMeta::new("GET", "/health").with_peer("203.0.113.5".parse().unwrap());
            assert!(matches!(gate.evaluate(&health).await.unwrap(), Verdict::Bypass));
        }
        assert!(gate.limiter().fallback().is_empty());
    }

    #[tokio::test]
    async fn test_dev_bypass_flag() {
        let config = GuardConfig {
            bypass: true,
            ..Default::default()
        };
        let gate = Gate::in_memory(&config);
        let huge = login("203.0.113.5").with_content_length(u64::MAX);
        assert!(matches!(gate.evaluate(&huge).await.unwrap(), Verdict::Bypass));
    }

    #[tokio::test]
    async fn test_payload_checked_before_counting() {
        let gate = Gate::in_memory(&GuardConfig::default());
        let request = login("203.0.113.5").with_content_length(11 * 1024 * 1024);

        match gate.evaluate(&request).await.unwrap() {
            Verdict::PayloadTooLarge { declared, max, .. } => {
                assert_eq!(declared, 11 * 1024 * 1024);
                assert_eq!(max, 10 * 1024 * 1024);
            }
            other => panic!("expected payload too large, got {:?}", other),
        }
        assert!(gate.limiter().fallback().is_empty());
    }

    #[tokio::test]
    async fn test_backend_outage_still_enforces() {
        let config = GuardConfig::default();
        let fallback = Arc::new(MemoryCounterStore::new());
        let limiter = RateLimiter::with_primary(Arc::new(OfflineStore::default()), fallback);
        let detector = PatternDetector::new(Arc::new(OfflineStore::default()), &config.detector);
        let ledger = ViolationLedger::new(Arc::new(MemoryViolationStore::new(
            config.ledger.retention(),
        )));
        let gate = Gate::new(&config, Arc::new(limiter), detector, ledger);

        for _ in 0..5 {
            assert!(gate.check(&login("203.0.113.5")).await.is_allowed());
        }
        match gate.check(&login("203.0.113.5")).await {
            Verdict::Limited { record: Some(record), .. } => {
                assert!(!record.suspicious_patterns.rapid_requests);
            }
            other => panic!("expected limited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ledger_outage_still_rejects_over_limit() {
        let mut config = GuardConfig::default();
        config.redis.url = Some("redis://127.0.0.1:1/".to_string());
        config.redis.timeout_ms = 200;
        let gate = Gate::from_config(&config).unwrap();
        assert!(gate.limiter().is_distributed());

        for _ in 0..5 {
            assert!(gate.check(&login("203.0.113.5")).await.is_allowed());
        }
        match gate.check(&login("203.0.113.5")).await {
            Verdict::Limited { record, .. } => assert!(record.is_none()),
            other => panic!("expected limited, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reset() {
        let mut config = GuardConfig::default();
        config.limits.endpoints[0].window_secs = 60;
        let gate = Gate::in_memory(&config);
        let request = login("203.0.113.5");

        for _ in 0..5 {
            gate.evaluate(&request).await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        match gate.evaluate(&request).await.unwrap() {
            Verdict::Allow { quota } => assert_eq!(quota.remaining, 4),
            other => panic!("expected allow, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_maintenance_tasks_start() {
        let gate = Gate::in_memory(&GuardConfig::default());
        let handles = gate.spawn_maintenance();
        assert_eq!(handles.len(), 2);
        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn test_paths_under_one_prefix_share_a_budget() {
        let gate = Gate::in_memory(&GuardConfig::default());
        let peer = "203.0.113.5".parse().unwrap();

        let mut allowed = 0;
        for i in 0..10 {
            let request = RequestMeta::new("GET", format!("/api/export/{}.csv", i))
                .with_peer(peer)
                .with_user_agent("Mozilla/5.0");
            if gate.evaluate(&request).await.unwrap().is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);

        let record = gate
            .ledger()
            .get("ip:203.0.113.5", "/api/export")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.violation_count, 2);
        assert!(record.is_banned);
        assert_eq!(record.penalty_level, PenaltyLevel::ShortBan);

        // The ban covers sibling paths as well
        let sibling = RequestMeta::new("GET", "/api/export/summary.pdf").with_peer(peer);
        assert!(matches!(
            gate.evaluate(&sibling).await.unwrap(),
            Verdict::Banned { .. }
        ));
    }

    #[tokio::test]
    async fn test_tier_budget_spans_paths() {
        let mut config = GuardConfig::default();
        config.limits.anonymous = LimitRule::new(3, 900);
        let gate = Gate::in_memory(&config);
        let peer = "203.0.113.5".parse().unwrap();

        for path in ["/api/tours/1", "/api/tours/2", "/api/blog"] {
            let request = RequestMeta::new("GET", path).with_peer(peer);
            assert!(gate.evaluate(&request).await.unwrap().is_allowed());
        }
        let request = RequestMeta::new("GET", "/api/reviews").with_peer(peer);
        assert!(matches!(
            gate.evaluate(&request).await.unwrap(),
            Verdict::Limited { .. }
        ));
        assert!(gate
            .ledger()
            .get("ip:203.0.113.5", TIER_ENDPOINT)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_missing_address_is_not_pooled() {
        let gate = Gate::in_memory(&GuardConfig::default());
        let request = RequestMeta::new("POST", "/api/auth/login").with_user_agent("Mozilla/5.0");

        for _ in 0..10 {
            assert!(matches!(
                gate.evaluate(&request).await.unwrap(),
                Verdict::Unidentified
            ));
        }
        assert!(gate.limiter().fallback().is_empty());

        // Payload ceiling still applies without an address
        let huge = request.clone().with_content_length(11 * 1024 * 1024);
        assert!(matches!(
            gate.evaluate(&huge).await.unwrap(),
            Verdict::PayloadTooLarge { .. }
        ));
    }
}
