//! Suspicious-pattern heuristics.
//!
//! The detector only flags. Its output is stored on the violation record and
//! never blocks a request by itself.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DetectorConfig;
use crate::identity::Identifier;
use crate::ratelimit::{CounterKey, CounterStore};
use crate::request::RequestMeta;

/// User-agent fragments typical of automation tools and HTTP libraries.
const AUTOMATION_SIGNATURES: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "scraper",
    "curl",
    "wget",
    "python",
    "java/",
    "go-http-client",
    "okhttp",
    "axios",
    "node-fetch",
    "libwww-perl",
    "httpclient",
];

/// Flags raised for a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspiciousPatterns {
    pub rapid_requests: bool,
    pub large_payload: bool,
    pub suspicious_bot: bool,
}

impl SuspiciousPatterns {
    pub fn any(&self) -> bool {
        self.rapid_requests || self.large_payload || self.suspicious_bot
    }

    /// Keep every flag ever raised.
    pub fn merge(&mut self, other: SuspiciousPatterns) {
        self.rapid_requests |= other.rapid_requests;
        self.large_payload |= other.large_payload;
        self.suspicious_bot |= other.suspicious_bot;
    }
}

/// Whether a user agent is missing or looks automated.
pub fn is_suspicious_agent(user_agent: Option<&str>) -> bool {
    match user_agent.map(str::trim) {
        None | Some("") => true,
        Some(agent) => {
            let agent = agent.to_ascii_lowercase();
            AUTOMATION_SIGNATURES
                .iter()
                .any(|signature| agent.contains(signature))
        }
    }
}

pub struct PatternDetector {
    /// Store for the auxiliary burst counter
    counter: Arc<dyn CounterStore>,
    max_payload_bytes: u64,
    rapid_threshold: u64,
    rapid_window: Duration,
}

impl PatternDetector {
    /// Create a new detector counting bursts in `counter`.
    pub fn new(counter: Arc<dyn CounterStore>, config: &DetectorConfig) -> Self {
        Self {
            counter,
            max_payload_bytes: config.max_payload_bytes,
            rapid_threshold: config.rapid_threshold,
            rapid_window: Duration::from_secs(config.rapid_window_secs),
        }
    }

    /// Largest declared body accepted, in bytes.
    pub fn max_payload_bytes(&self) -> u64 {
        self.max_payload_bytes
    }

    /// Declared body size above the ceiling.
    pub fn is_large_payload(&self, request: &RequestMeta) -> bool {
        request
            .content_length
            .is_some_and(|len| len > self.max_payload_bytes)
    }

    /// Inspect a request from `identifier`.
    pub async fn detect(&self, request: &RequestMeta, identifier: &Identifier) -> SuspiciousPatterns {
        let patterns = SuspiciousPatterns {
            rapid_requests: self.is_rapid(identifier).await,
            large_payload: self.is_large_payload(request),
            suspicious_bot: is_suspicious_agent(request.user_agent.as_deref()),
        };
        if patterns.any() {
            debug!(identifier = %identifier, patterns = ?patterns, "Suspicious patterns detected");
        }
        patterns
    }

    /// More than `rapid_threshold` hits in the trailing burst window.
    async fn is_rapid(&self, identifier: &Identifier) -> bool {
        let key = CounterKey::burst(identifier).to_string_key();
        match self
            .counter
            .consume(&key, self.rapid_threshold, self.rapid_window)
            .await
        {
            Ok(consumption) => !consumption.allowed,
            Err(e) => {
                debug!(identifier = %identifier, error = %e, "Burst counter unavailable");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{MemoryCounterStore, OfflineStore};

    fn detector(counter: Arc<dyn CounterStore>) -> PatternDetector {
        PatternDetector::new(counter, &DetectorConfig::default())
    }

    fn browser_request() -> RequestMeta {
        RequestMeta::new("GET", "/api/tours")
            .with_user_agent("Mozilla/5.0 (Macintosh; Intel Mac OS X 14_0) Safari/605.1.15")
    }

    #[test]
    fn test_suspicious_agents() {
        assert!(is_suspicious_agent(None));
        assert!(is_suspicious_agent(Some("   ")));
        assert!(is_suspicious_agent(Some("curl/8.4.0")));
        assert!(is_suspicious_agent(Some("Googlebot/2.1")));
        assert!(is_suspicious_agent(Some("Python-Requests/2.31")));
        assert!(is_suspicious_agent(Some("Go-http-client/1.1")));
        assert!(is_suspicious_agent(Some("WGET/1.21")));
        assert!(!is_suspicious_agent(Some("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)")));
    }

    #[tokio::test]
    async fn test_clean_request_raises_nothing() {
        let detector = detector(Arc::new(MemoryCounterStore::new()));
        let patterns = detector
            .detect(&browser_request(), &Identifier::ip("203.0.113.5"))
            .await;
        assert_eq!(patterns, SuspiciousPatterns::default());
        assert!(!patterns.any());
    }

    #[tokio::test]
    async fn test_large_payload_flag() {
        let detector = detector(Arc::new(MemoryCounterStore::new()));
        let ceiling = detector.max_payload_bytes();

        let at_limit = browser_request().with_content_length(ceiling);
        assert!(!detector.is_large_payload(&at_limit));

        let over = browser_request().with_content_length(ceiling + 1);
        let patterns = detector.detect(&over, &Identifier::ip("203.0.113.5")).await;
        assert!(patterns.large_payload);
    }

    #[tokio::test]
    async fn test_rapid_requests_after_threshold() {
        let detector = detector(Arc::new(MemoryCounterStore::new()));
        let id = Identifier::ip("203.0.113.5");
        let request = browser_request();

        for _ in 0..10 {
            assert!(!detector.detect(&request, &id).await.rapid_requests);
        }
        assert!(detector.detect(&request, &id).await.rapid_requests);

        // Other actors are unaffected
        let other = Identifier::ip("198.51.100.7");
        assert!(!detector.detect(&request, &other).await.rapid_requests);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_window_is_short() {
        let detector = detector(Arc::new(MemoryCounterStore::new()));
        let id = Identifier::user("9");
        let request = browser_request();

        for _ in 0..11 {
            detector.detect(&request, &id).await;
        }
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(!detector.detect(&request, &id).await.rapid_requests);
    }

    #[tokio::test]
    async fn test_backend_outage_defaults_to_not_rapid() {
        let detector = detector(Arc::new(OfflineStore::default()));
        let id = Identifier::ip("203.0.113.5");

        for _ in 0..20 {
            let patterns = detector.detect(&browser_request(), &id).await;
            assert!(!patterns.rapid_requests);
        }
    }

    #[test]
    fn test_merge_is_sticky() {
        let mut seen = SuspiciousPatterns {
            suspicious_bot: true,
            ..Default::default()
        };
        seen.merge(SuspiciousPatterns {
            rapid_requests: true,
            ..Default::default()
        });
        assert!(seen.suspicious_bot);
        assert!(seen.rapid_requests);
        assert!(!seen.large_payload);
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(SuspiciousPatterns {
            rapid_requests: true,
            large_payload: false,
            suspicious_bot: true,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"rapidRequests": true, "largePayload": false, "suspiciousBot": true})
        );
    }
}
