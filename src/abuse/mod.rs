//! Abuse tracking: pattern heuristics and the violation ledger.

mod detector;
mod ledger;
mod store;

pub use detector::{is_suspicious_agent, PatternDetector, SuspiciousPatterns};
pub use ledger::{PenaltyLevel, RequestMetadata, ViolationLedger, ViolationRecord};
pub use store::{spawn_purger, MemoryViolationStore, RedisViolationStore, ViolationStore};
