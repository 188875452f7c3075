//! Rate limit headers and rejection bodies.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::abuse::ViolationRecord;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Quota state reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl Quota {
    /// Write the `X-RateLimit-*` headers.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        if let Ok(reset) = HeaderValue::from_str(&iso_timestamp(self.reset_at)) {
            headers.insert(X_RATELIMIT_RESET, reset);
        }
    }

    /// Seconds until the window resets, at least one.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }
}

/// `2026-10-19T08:30:00.000Z`
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// JSON body of every rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub success: bool,
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ban_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty_level: Option<u8>,
}

impl RejectionBody {
    fn new(error: &str, message: String) -> Self {
        Self {
            success: false,
            error: error.to_string(),
            message,
            retry_after: None,
            limit: None,
            window: None,
            violation_count: None,
            ban_expires_at: None,
            penalty_level: None,
        }
    }
}

fn respond(status: StatusCode, headers: HeaderMap, body: RejectionBody) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().extend(headers);
    response
}

fn retry_after_header(headers: &mut HeaderMap, secs: u64) {
    headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
}

/// 413 for a declared body over the ceiling.
pub fn payload_too_large(declared: u64, max: u64, limit: u64) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));

    let body = RejectionBody::new(
        "Payload too large",
        format!(
            "Request body of {} bytes exceeds the {} byte limit",
            declared, max
        ),
    );
    respond(StatusCode::PAYLOAD_TOO_LARGE, headers, body)
}

/// 429 for an actor under an active ban.
pub fn banned(limit: u64, record: &ViolationRecord, now: DateTime<Utc>) -> Response {
    let retry_after = record.retry_after_secs(now).map(|secs| secs.max(1));

    let mut headers = HeaderMap::new();
    Quota {
        limit,
        remaining: 0,
        reset_at: record.ban_expires_at.unwrap_or(now),
    }
    .apply(&mut headers);
    if let Some(secs) = retry_after {
        retry_after_header(&mut headers, secs);
    }

    let message = match record.ban_expires_at {
        Some(expires) => format!(
            "Too many violations. Access suspended until {}",
            iso_timestamp(expires)
        ),
        None => "Access to this endpoint has been suspended".to_string(),
    };
    let mut body = RejectionBody::new("Temporarily banned", message);
    body.retry_after = retry_after;
    body.ban_expires_at = record.ban_expires_at;
    body.penalty_level = Some(record.penalty_level.as_u8());
    body.violation_count = Some(record.violation_count);

    respond(StatusCode::TOO_MANY_REQUESTS, headers, body)
}

/// 429 for a request over its window limit.
pub fn limited(
    quota: &Quota,
    window_secs: u64,
    record: Option<&ViolationRecord>,
    now: DateTime<Utc>,
) -> Response {
    let retry_after = quota.retry_after_secs(now);

    let mut headers = HeaderMap::new();
    quota.apply(&mut headers);
    retry_after_header(&mut headers, retry_after);

    let mut body = RejectionBody::new(
        "Too many requests",
        format!(
            "Rate limit of {} requests per {} seconds exceeded. Try again in {} seconds",
            quota.limit, window_secs, retry_after
        ),
    );
    body.retry_after = Some(retry_after);
    body.limit = Some(quota.limit);
    body.window = Some(window_secs);
    if let Some(record) = record {
        body.violation_count = Some(record.violation_count);
        body.penalty_level = Some(record.penalty_level.as_u8());
        body.ban_expires_at = record.ban_expires_at;
    }

    respond(StatusCode::TOO_MANY_REQUESTS, headers, body)
}
