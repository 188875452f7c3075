//! Violation records and the progressive penalty state machine.
//!
//! Every `(identifier, endpoint)` pair that has exceeded its limit owns one
//! record. Each violation raises the penalty level:
//!
//! | violations | level | ban      |
//! |------------|-------|----------|
//! | 1          | 1     | none     |
//! | 2          | 2     | 5 min    |
//! | 3+         | 3     | 1 hour   |
//!
//! Level 3 is terminal: further violations keep counting and re-apply the
//! one hour ban. Expired bans are cleared lazily when next checked.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::detector::SuspiciousPatterns;
use super::store::ViolationStore;
use crate::error::Result;
use crate::identity::Identifier;
use crate::request::RequestMeta;

/// Discrete escalation stage of a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PenaltyLevel {
    #[default]
    Clear = 0,
    Warning = 1,
    ShortBan = 2,
    LongBan = 3,
}

impl PenaltyLevel {
    /// Level reached after `violations` total violations.
    pub fn for_violations(violations: u32) -> Self {
        match violations {
            0 => PenaltyLevel::Clear,
            1 => PenaltyLevel::Warning,
            2 => PenaltyLevel::ShortBan,
            _ => PenaltyLevel::LongBan,
        }
    }

    /// Ban length imposed automatically at this level.
    pub fn ban_duration(&self) -> Option<Duration> {
        match self {
            PenaltyLevel::Clear | PenaltyLevel::Warning => None,
            PenaltyLevel::ShortBan => Some(Duration::minutes(5)),
            PenaltyLevel::LongBan => Some(Duration::hours(1)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl From<PenaltyLevel> for u8 {
    fn from(level: PenaltyLevel) -> Self {
        level.as_u8()
    }
}

impl TryFrom<u8> for PenaltyLevel {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(PenaltyLevel::Clear),
            1 => Ok(PenaltyLevel::Warning),
            2 => Ok(PenaltyLevel::ShortBan),
            3 => Ok(PenaltyLevel::LongBan),
            other => Err(format!("penalty level {} out of range 0..=3", other)),
        }
    }
}

/// Snapshot of the request that caused the latest violation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    pub method: String,
    pub path: String,
    pub payload_size: Option<u64>,
}

impl From<&RequestMeta> for RequestMetadata {
    fn from(request: &RequestMeta) -> Self {
        Self {
            method: request.method.clone(),
            path: request.path.clone(),
            payload_size: request.content_length,
        }
    }
}

/// Most recent note lines kept on a record.
const MAX_NOTES: usize = 20;

/// Durable abuse record, unique per `(identifier, endpoint)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    pub identifier: String,
    pub endpoint: String,
    pub violation_count: u32,
    pub penalty_level: PenaltyLevel,
    pub is_banned: bool,
    /// `None` while banned means permanent
    pub ban_expires_at: Option<DateTime<Utc>>,
    pub last_violation_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub request_metadata: RequestMetadata,
    pub suspicious_patterns: SuspiciousPatterns,
    /// Newline separated history, oldest lines dropped past `MAX_NOTES`
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ViolationRecord {
    /// Create a clean record with no violations.
    pub fn new(identifier: &str, endpoint: &str, now: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.to_string(),
            endpoint: endpoint.to_string(),
            violation_count: 0,
            penalty_level: PenaltyLevel::Clear,
            is_banned: false,
            ban_expires_at: None,
            last_violation_at: now,
            user_agent: None,
            request_metadata: RequestMetadata::default(),
            suspicious_patterns: SuspiciousPatterns::default(),
            notes: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Count one more violation and escalate.
    pub fn apply_penalty(&mut self, now: DateTime<Utc>) {
        self.violation_count = self.violation_count.saturating_add(1);
        self.penalty_level = PenaltyLevel::for_violations(self.violation_count);
        self.last_violation_at = now;
        self.updated_at = now;

        match self.penalty_level.ban_duration() {
            Some(duration) => {
                self.is_banned = true;
                self.ban_expires_at = Some(now + duration);
                self.append_note(&format!(
                    "{}: level {} ban for {} minutes after {} violations",
                    now.to_rfc3339(),
                    self.penalty_level.as_u8(),
                    duration.num_minutes(),
                    self.violation_count
                ));
            }
            None => {
                self.append_note(&format!("{}: warning issued", now.to_rfc3339()));
            }
        }
    }

    /// Lift any ban. The violation history is kept.
    pub fn clear_ban(&mut self, now: DateTime<Utc>) {
        self.is_banned = false;
        self.ban_expires_at = None;
        self.penalty_level = PenaltyLevel::Clear;
        self.updated_at = now;
    }

    /// Ban without expiry; only reachable through administration.
    pub fn ban_permanently(&mut self, note: &str, now: DateTime<Utc>) {
        self.is_banned = true;
        self.ban_expires_at = None;
        self.penalty_level = PenaltyLevel::LongBan;
        self.updated_at = now;
        self.append_note(&format!("{}: permanent ban: {}", now.to_rfc3339(), note));
    }

    /// Banned and the ban has not run out.
    pub fn is_ban_active(&self, now: DateTime<Utc>) -> bool {
        self.is_banned && self.ban_expires_at.map_or(true, |expires| expires > now)
    }

    /// Banned but the ban has already run out.
    pub fn is_ban_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_banned && self.ban_expires_at.is_some_and(|expires| expires <= now)
    }

    /// Whole seconds until the ban lifts, rounded up.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        let expires = self.ban_expires_at?;
        let millis = (expires - now).num_milliseconds().max(0) as u64;
        Some(millis.div_ceil(1000))
    }

    fn append_note(&mut self, note: &str) {
        if !self.notes.is_empty() {
            self.notes.push('\n');
        }
        self.notes.push_str(note);

        let lines = self.notes.lines().count();
        if lines > MAX_NOTES {
            if let Some((cut, _)) = self.notes.match_indices('\n').nth(lines - MAX_NOTES - 1) {
                self.notes.drain(..=cut);
            }
        }
    }
}

/// The single writer of violation state.
pub struct ViolationLedger {
    store: Arc<dyn ViolationStore>,
}

impl ViolationLedger {
    /// Create a new ledger over the given store.
    pub fn new(store: Arc<dyn ViolationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ViolationStore> {
        &self.store
    }

    /// Look up a record without side effects.
    pub async fn get(&self, identifier: &str, endpoint: &str) -> Result<Option<ViolationRecord>> {
        self.store.load(identifier, endpoint).await
    }

    /// Fetch the record for a pair, creating it if absent.
    pub async fn find_or_create(&self, identifier: &str, endpoint: &str) -> Result<ViolationRecord> {
        if let Some(record) = self.store.load(identifier, endpoint).await? {
            return Ok(record);
        }
        let record = ViolationRecord::new(identifier, endpoint, Utc::now());
        self.store.save(&record).await?;
        Ok(record)
    }

    /// The record if the pair is currently banned.
    ///
    /// A ban that has run out is cleared and persisted here, so no background
    /// task is needed for ban expiry.
    pub async fn check_ban(&self, identifier: &str, endpoint: &str) -> Result<Option<ViolationRecord>> {
        let Some(mut record) = self.store.load(identifier, endpoint).await? else {
            return Ok(None);
        };

        let now = Utc::now();
        if record.is_ban_expired(now) {
            info!(identifier = %identifier, endpoint = %endpoint, "Ban expired, clearing");
            record.clear_ban(now);
            self.store.save(&record).await?;
            return Ok(None);
        }

        Ok(record.is_ban_active(now).then_some(record))
    }

    /// Escalate a record by one violation and persist it.
    pub async fn apply_penalty(&self, mut record: ViolationRecord) -> Result<ViolationRecord> {
        record.apply_penalty(Utc::now());
        self.store.save(&record).await?;

        counter!(
            "abuseguard_violations_total",
            "penalty_level" => record.penalty_level.as_u8().to_string()
        )
        .increment(1);
        warn!(
            identifier = %record.identifier,
            endpoint = %record.endpoint,
            violations = record.violation_count,
            penalty_level = record.penalty_level.as_u8(),
            banned = record.is_banned,
            "Rate limit violation recorded"
        );
        Ok(record)
    }

    /// Record a violation observed on `request`.
    pub async fn record_violation(
        &self,
        identifier: &Identifier,
        endpoint: &str,
        request: &RequestMeta,
        patterns: SuspiciousPatterns,
    ) -> Result<ViolationRecord> {
        let mut record = self.find_or_create(identifier.as_str(), endpoint).await?;
        record.user_agent = request.user_agent.clone();
        record.request_metadata = RequestMetadata::from(request);
        record.suspicious_patterns.merge(patterns);
        self.apply_penalty(record).await
    }

    /// Administrative reset of a ban.
    pub async fn clear_ban(&self, mut record: ViolationRecord) -> Result<ViolationRecord> {
        record.clear_ban(Utc::now());
        self.store.save(&record).await?;
        info!(identifier = %record.identifier, endpoint = %record.endpoint, "Ban cleared");
        Ok(record)
    }

    /// Administrative ban with no expiry.
    pub async fn ban_permanently(
        &self,
        identifier: &str,
        endpoint: &str,
        note: &str,
    ) -> Result<ViolationRecord> {
        let mut record = self.find_or_create(identifier, endpoint).await?;
        record.ban_permanently(note, Utc::now());
        self.store.save(&record).await?;
        warn!(identifier = %identifier, endpoint = %endpoint, "Permanent ban applied");
        Ok(record)
    }
}
