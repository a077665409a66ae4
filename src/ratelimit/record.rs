//! Persisted rate limit state and the decisions derived from it.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// The stored state for one rate limited key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRecord {
    /// Identity the requests are counted under
    pub key: String,
    /// Requests observed in the current window
    pub count: u64,
    /// When the current window ends
    #[serde(serialize_with = "serialize_iso_millis")]
    pub reset_at: DateTime<Utc>,
    /// When the current window started
    #[serde(serialize_with = "serialize_iso_millis")]
    pub created_at: DateTime<Utc>,
}

impl RateLimitRecord {
    /// Whether the window has ended at `now`.
    ///
    /// A request arriving exactly at `reset_at` already belongs to the next window.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.reset_at <= now
    }
}

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Request count after this request was applied
    pub current: u64,
    /// Configured maximum
    pub limit: u64,
    /// Configured window length in seconds
    pub window_seconds: u64,
    /// When the current window ends
    #[serde(serialize_with = "serialize_iso_millis")]
    pub reset_at: DateTime<Utc>,
    /// Requests left in the current window
    pub remaining: u64,
}

impl RateLimitDecision {
    /// `reset_at` as an ISO-8601 string with millisecond precision.
    pub fn reset_at_iso(&self) -> String {
        iso_millis(&self.reset_at)
    }

    /// Standard rate limit headers describing this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at_iso()),
            ("X-RateLimit-Current", self.current.to_string()),
        ]
    }
}

fn iso_millis(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn serialize_iso_millis<S: Serializer>(
    timestamp: &DateTime<Utc>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&iso_millis(timestamp))
}
