//! Fixed-window counting rule.
//!
//! Every backend applies the same rule: a key without a record, or whose
//! record has reached `reset_at`, starts a fresh window at count 1; any other
//! request increments the count and keeps the window end. Store-backed
//! implementations evaluate this rule inside a single atomic store-side
//! operation and use [`WindowCounter::decide`] to derive the decision.

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::MAX_WINDOW_SECS;

use super::record::{RateLimitDecision, RateLimitRecord};

/// Applies the fixed-window rule for one limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    max_requests: u64,
    window_seconds: u64,
}

impl WindowCounter {
    /// Create a counter for `max_requests` per `window_seconds`.
    pub fn new(max_requests: u64, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }

    /// Window length as a signed duration.
    pub fn window(&self) -> TimeDelta {
        TimeDelta::seconds(self.window_seconds.min(MAX_WINDOW_SECS) as i64)
    }

    /// Produce the record that results from one more request at `now`.
    pub fn advance(
        &self,
        key: &str,
        existing: Option<&RateLimitRecord>,
        now: DateTime<Utc>,
    ) -> RateLimitRecord {
        match existing {
            Some(record) if !record.is_expired(now) => RateLimitRecord {
                count: record.count.saturating_add(1),
                ..record.clone()
            },
            _ => RateLimitRecord {
                key: key.to_string(),
                count: 1,
                reset_at: now + self.window(),
                created_at: now,
            },
        }
    }

    /// Derive the decision for a record that already includes this request.
    pub fn decide(&self, record: &RateLimitRecord) -> RateLimitDecision {
        RateLimitDecision {
            allowed: record.count <= self.max_requests,
            current: record.count,
            limit: self.max_requests,
            window_seconds: self.window_seconds,
            reset_at: record.reset_at,
            remaining: self.max_requests.saturating_sub(record.count),
        }
    }

    /// Decision handed out when the store could not be consulted.
    pub fn fail_open(&self, now: DateTime<Utc>) -> RateLimitDecision {
        RateLimitDecision {
            allowed: true,
            current: 0,
            limit: self.max_requests,
            window_seconds: self.window_seconds,
            reset_at: now + self.window(),
            remaining: self.max_requests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    #[test]
    fn test_first_request_opens_window() {
        let counter = WindowCounter::new(5, 60);
        let record = counter.advance("k", None, t(0));

        assert_eq!(record.key, "k");
        assert_eq!(record.count, 1);
        assert_eq!(record.created_at, t(0));
        assert_eq!(record.reset_at, t(60));
    }

    #[test]
    fn test_increment_keeps_window_end() {
        let counter = WindowCounter::new(5, 60);
        let first = counter.advance("k", None, t(0));
        let second = counter.advance("k", Some(&first), t(30));

        assert_eq!(second.count, 2);
        assert_eq!(second.reset_at, t(60));
        assert_eq!(second.created_at, t(0));
    }

    #[test]
    fn test_request_at_reset_instant_starts_new_window() {
        let counter = WindowCounter::new(5, 60);
        let mut record = counter.advance("k", None, t(0));
        for _ in 0..3 {
            record = counter.advance("k", Some(&record), t(10));
        }
        assert_eq!(record.count, 4);

        let rolled = counter.advance("k", Some(&record), t(60));
        assert_eq!(rolled.count, 1);
        assert_eq!(rolled.created_at, t(60));
        assert_eq!(rolled.reset_at, t(120));
    }

    #[test]
    fn test_threshold() {
        let counter = WindowCounter::new(2, 60);
        let mut record = None;
        let mut decisions = Vec::new();
        for second in 0..3 {
            let next = counter.advance("k", record.as_ref(), t(second));
            decisions.push(counter.decide(&next));
            record = Some(next);
        }

        let summary: Vec<_> = decisions
            .iter()
            .map(|d| (d.current, d.allowed, d.remaining))
            .collect();
        assert_eq!(summary, vec![(1, true, 1), (2, true, 0), (3, false, 0)]);
    }

    #[test]
    fn test_zero_limit_denies_everything() {
        let counter = WindowCounter::new(0, 60);
        let record = counter.advance("k", None, t(0));
        let decision = counter.decide(&record);

        assert!(!decision.allowed);
        assert_eq!(decision.current, 1);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_fail_open_decision() {
        let counter = WindowCounter::new(7, 30);
        let decision = counter.fail_open(t(5));

        assert!(decision.allowed);
        assert_eq!(decision.current, 0);
        assert_eq!(decision.remaining, 7);
        assert_eq!(decision.limit, 7);
        assert_eq!(decision.reset_at, t(35));
    }
}
