//! Fixed-window counter state and the per-request quota decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::clock::{add_duration, elapsed};

/// Counter state for one (client, rule) pair.
///
/// `window_start` only moves forward when a full window has elapsed, at
/// which point the count starts over at 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRateLimitState {
    /// Requests admitted in the current window
    pub request_count: u64,
    /// When the current window opened
    pub window_start: DateTime<Utc>,
    /// Last time the counter was touched
    pub last_request_at: DateTime<Utc>,
}

impl ClientRateLimitState {
    /// A window opened by a single request at `now`.
    pub fn first_request(now: DateTime<Utc>) -> Self {
        Self {
            request_count: 1,
            window_start: now,
            last_request_at: now,
        }
    }

    /// A window with nothing counted yet.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            request_count: 0,
            window_start: now,
            last_request_at: now,
        }
    }

    /// Whether a full window has elapsed since `window_start`.
    pub fn is_window_expired(&self, now: DateTime<Utc>, period: Duration) -> bool {
        elapsed(self.window_start, now) >= period
    }

    /// When the current window closes.
    pub fn reset_time(&self, period: Duration) -> DateTime<Utc> {
        add_duration(self.window_start, period)
    }

    /// Record one more request.
    pub fn record(&mut self, now: DateTime<Utc>) {
        self.request_count = self.request_count.saturating_add(1);
        self.last_request_at = now;
    }

    /// Count a request against a window of `period` holding at most `limit`.
    ///
    /// An expired window restarts at `now` with this request in it. A full
    /// window is left as it is and the request is refused.
    pub fn try_admit(&mut self, now: DateTime<Utc>, period: Duration, limit: u64) -> bool {
        if self.is_window_expired(now, period) {
            *self = Self::first_request(now);
            true
        } else if self.request_count < limit {
            self.record(now);
            true
        } else {
            false
        }
    }
}

/// Result of one atomic admission attempt against storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub admitted: bool,
    /// Counter after the attempt
    pub state: ClientRateLimitState,
}

/// Outcome of a single rate limit check. Computed fresh on every request.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u64,
    /// `max(0, limit - count)`
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
    /// Zero unless denied
    pub retry_after: Duration,
    /// Name of the rule that produced this decision
    pub rule: String,
    /// Storage was unavailable and the request was let through blind
    pub degraded: bool,
}

impl RateLimitResult {
    /// An admitted request whose counter now stands at `state.request_count`.
    pub fn allowed(rule: &str, limit: u64, period: Duration, state: &ClientRateLimitState) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(state.request_count),
            reset_time: state.reset_time(period),
            retry_after: Duration::ZERO,
            rule: rule.to_string(),
            degraded: false,
        }
    }

    /// A rejected request. The window is left untouched.
    pub fn denied(
        rule: &str,
        limit: u64,
        period: Duration,
        state: &ClientRateLimitState,
        now: DateTime<Utc>,
    ) -> Self {
        let reset_time = state.reset_time(period);
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_time,
            retry_after: elapsed(now, reset_time),
            rule: rule.to_string(),
            degraded: false,
        }
    }

    /// Let the request through without quota data.
    pub fn fail_open(rule: &str, limit: u64, now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_time: now,
            retry_after: Duration::ZERO,
            rule: rule.to_string(),
            degraded: true,
        }
    }

    /// Reset time as unix seconds.
    pub fn reset_unix(&self) -> i64 {
        self.reset_time.timestamp()
    }

    /// Retry delay in whole seconds, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::add_duration;

    #[test]
    fn test_window_expiry_boundary() {
        let start = Utc::now();
        let state = ClientRateLimitState::first_request(start);
        let period = Duration::from_secs(60);

        assert!(!state.is_window_expired(add_duration(start, Duration::from_secs(59)), period));
        assert!(state.is_window_expired(add_duration(start, period), period));
    }

    #[test]
    fn test_record_updates_last_request() {
        let start = Utc::now();
        let mut state = ClientRateLimitState::first_request(start);
        let later = add_duration(start, Duration::from_secs(3));
        state.record(later);

        assert_eq!(state.request_count, 2);
        assert_eq!(state.window_start, start);
        assert_eq!(state.last_request_at, later);
    }

    #[test]
    fn test_try_admit_counts_until_full() {
        let start = Utc::now();
        let period = Duration::from_secs(60);
        let mut state = ClientRateLimitState::first_request(start);

        assert!(state.try_admit(start, period, 2));
        assert_eq!(state.request_count, 2);
        assert!(!state.try_admit(start, period, 2));
        assert_eq!(state.request_count, 2);
        assert_eq!(state.last_request_at, start);
    }

    #[test]
    fn test_try_admit_restarts_expired_window() {
        let start = Utc::now();
        let period = Duration::from_secs(60);
        let mut state = ClientRateLimitState::first_request(start);
        state.request_count = 5;

        let later = add_duration(start, period);
        assert!(state.try_admit(later, period, 5));
        assert_eq!(state, ClientRateLimitState::first_request(later));
    }

    #[test]
    fn test_remaining_never_negative() {
        let now = Utc::now();
        let mut state = ClientRateLimitState::first_request(now);
        state.request_count = 12;

        let result = RateLimitResult::allowed("default", 10, Duration::from_secs(60), &state);
        assert_eq!(result.remaining, 0);
    }

    #[test]
    fn test_denied_retry_after() {
        let start = Utc::now();
        let state = ClientRateLimitState::first_request(start);
        let now = add_duration(start, Duration::from_millis(10_500));

        let result = RateLimitResult::denied("auth", 1, Duration::from_secs(60), &state, now);
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.retry_after, Duration::from_millis(49_500));
        assert_eq!(result.retry_after_secs(), 50);
        assert_eq!(result.reset_time, add_duration(start, Duration::from_secs(60)));
    }

    #[test]
    fn test_fail_open_is_degraded() {
        let result = RateLimitResult::fail_open("default", 100, Utc::now());
        assert!(result.allowed);
        assert!(result.degraded);
    }
}
