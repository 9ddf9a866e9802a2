//! Retry decisions and exponential backoff
//!
//! After every attempt the dispatch loop asks [`should_retry`] whether to go
//! again and how long to wait first. Retry `n` (1-based) waits
//! `base_delay * multiplier^(n-1)`, optionally capped and jittered.

use std::collections::BTreeSet;
use std::time::Duration;

use rand::Rng;
use reqwest::header::RETRY_AFTER;

use crate::errors::{ErrorKind, PulsewireError, Result};
use crate::request::Response;

/// Randomization applied to computed delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Use the computed delay exactly
    #[default]
    None,
    /// Pick uniformly in `[0, delay]`
    Full,
}

/// Retry configuration, shared read-only by every request of a client
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` disables retrying
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Growth factor per retry, at least `1.0`
    pub multiplier: f64,
    /// Upper bound for a single delay
    pub max_delay: Option<Duration>,
    pub jitter: Jitter,
    pub retryable_status_codes: BTreeSet<u16>,
    pub retryable_error_kinds: BTreeSet<ErrorKind>,
    /// Prefer a server `Retry-After: <seconds>` over the computed delay
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: None,
            jitter: Jitter::None,
            retryable_status_codes: [
                408, // Request Timeout
                429, // Too Many Requests
                500, // Internal Server Error
                502, // Bad Gateway
                503, // Service Unavailable
                504, // Gateway Timeout
            ]
            .into_iter()
            .collect(),
            retryable_error_kinds: [ErrorKind::Connection, ErrorKind::Timeout].into_iter().collect(),
            respect_retry_after: false,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the retryable status codes
    #[must_use]
    pub fn with_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    /// Replace the retryable error kinds
    #[must_use]
    pub fn with_error_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_error_kinds = kinds.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_respect_retry_after(mut self, respect: bool) -> Self {
        self.respect_retry_after = respect;
        self
    }

    /// Reject configurations the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(PulsewireError::Config(format!(
                "retry multiplier must be a finite number >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Whether an outcome is eligible for a retry, ignoring the attempt budget
    pub fn is_retryable(&self, outcome: &Outcome<'_>) -> bool {
        match outcome {
            Outcome::Response(response) => self.retryable_status_codes.contains(&response.status.as_u16()),
            Outcome::Failure(error) => self.retryable_error_kinds.contains(&error.kind()),
        }
    }

    /// Delay before retry `retry` (1-based), before jitter and `Retry-After`
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(retry.saturating_sub(1).min(i32::MAX as u32) as i32);
        let nanos = (self.base_delay.as_nanos() as f64 * factor).round();
        let delay = if nanos.is_finite() && nanos < u64::MAX as f64 {
            Duration::from_nanos(nanos as u64)
        } else {
            Duration::MAX
        };
        self.cap(delay)
    }

    fn cap(&self, delay: Duration) -> Duration {
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// Per-invocation attempt bookkeeping, owned by one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttemptState {
    /// Zero for the first attempt
    pub attempt_number: u32,
    /// Total time spent waiting between attempts
    pub elapsed_delay: Duration,
}

impl AttemptState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a completed wait and move to the next attempt
    pub fn advance(&mut self, waited: Duration) {
        self.attempt_number += 1;
        self.elapsed_delay += waited;
    }
}

/// What an attempt produced
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    Response(&'a Response),
    Failure(&'a PulsewireError),
}

/// Result of a retry evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub fn stop() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }

    pub fn after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }
}

/// Decide whether to retry after `state.attempt_number` produced `outcome`
pub fn should_retry(state: &AttemptState, outcome: Outcome<'_>, policy: &RetryPolicy) -> RetryDecision {
    if state.attempt_number >= policy.max_retries || !policy.is_retryable(&outcome) {
        return RetryDecision::stop();
    }

    let server_delay = match outcome {
        Outcome::Response(response) if policy.respect_retry_after => response
            .headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after),
        _ => None,
    };

    let delay = match server_delay {
        Some(delay) => policy.cap(delay),
        None => apply_jitter(policy.backoff(state.attempt_number + 1), policy.jitter),
    };

    RetryDecision::after(delay)
}

fn apply_jitter(delay: Duration, jitter: Jitter) -> Duration {
    match jitter {
        Jitter::None => delay,
        Jitter::Full => {
            let max = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
            Duration::from_nanos(rand::rng().random_range(0..=max))
        }
    }
}

/// Parse a `Retry-After` header in delay-seconds form
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};
    use reqwest::StatusCode;

    fn response(status: u16) -> Response {
        Response::new(StatusCode::from_u16(status).unwrap(), HeaderMap::new(), "")
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(200));
        assert_eq!(policy.max_delay, None);
        assert_eq!(policy.jitter, Jitter::None);
        assert_eq!(
            policy.retryable_status_codes.iter().copied().collect::<Vec<_>>(),
            vec![408, 429, 500, 502, 503, 504]
        );
        assert_eq!(
            policy.retryable_error_kinds.iter().copied().collect::<Vec<_>>(),
            vec![ErrorKind::Connection, ErrorKind::Timeout]
        );
        assert!(!policy.respect_retry_after);
    }

    fn state(attempt_number: u32) -> AttemptState {
        AttemptState {
            attempt_number,
            elapsed_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_backoff_is_exact_exponential() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(100))
            .with_multiplier(2.0)
            .with_max_retries(5);

        let expected = [100, 200, 400, 800, 1600];
        for (k, ms) in (1..=5).zip(expected) {
            assert_eq!(policy.backoff(k), Duration::from_millis(ms), "retry {k}");
        }
    }

    #[test]
    fn test_backoff_fractional_multiplier() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(100))
            .with_multiplier(1.5);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(150));
        assert_eq!(policy.backoff(3), Duration::from_millis(225));
    }

    #[test]
    fn test_backoff_respects_cap_and_saturates() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(5));
        assert_eq!(policy.backoff(500), Duration::from_secs(5));

        let uncapped = RetryPolicy::default().with_base_delay(Duration::from_secs(1));
        assert_eq!(uncapped.backoff(10_000), Duration::MAX);
    }

    #[test]
    fn test_decision_delay_matches_attempt() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(50))
            .with_multiplier(3.0)
            .with_status_codes([503]);
        let resp = response(503);

        let first = should_retry(&state(0), Outcome::Response(&resp), &policy);
        assert_eq!(first, RetryDecision::after(Duration::from_millis(50)));

        let second = should_retry(&state(1), Outcome::Response(&resp), &policy);
        assert_eq!(second, RetryDecision::after(Duration::from_millis(150)));
    }

    #[test]
    fn test_budget_exhausted_never_retries() {
        let policy = RetryPolicy::default().with_max_retries(2).with_status_codes([503]);
        let resp = response(503);
        assert!(should_retry(&state(1), Outcome::Response(&resp), &policy).retry);
        assert!(!should_retry(&state(2), Outcome::Response(&resp), &policy).retry);
        assert!(!should_retry(&state(7), Outcome::Response(&resp), &policy).retry);
    }

    #[test]
    fn test_non_retryable_status() {
        let policy = RetryPolicy::default().with_status_codes([500, 502, 503]);
        let resp = response(404);
        assert_eq!(should_retry(&state(0), Outcome::Response(&resp), &policy), RetryDecision::stop());
    }

    #[test]
    fn test_error_kind_classification() {
        let policy = RetryPolicy::default().with_error_kinds([ErrorKind::Connection]);
        let conn = PulsewireError::Connection("refused".into());
        let timeout = PulsewireError::Timeout(1.0);
        let hook = PulsewireError::interceptor("auth", "token fetch failed");

        assert!(should_retry(&state(0), Outcome::Failure(&conn), &policy).retry);
        assert!(!should_retry(&state(0), Outcome::Failure(&timeout), &policy).retry);
        assert!(!should_retry(&state(0), Outcome::Failure(&hook), &policy).retry);

        let hooks_retryable = policy.with_error_kinds([ErrorKind::InterceptorFailed]);
        assert!(should_retry(&state(0), Outcome::Failure(&hook), &hooks_retryable).retry);
    }

    #[test]
    fn test_no_retry_policy() {
        let policy = RetryPolicy::no_retry();
        let conn = PulsewireError::Connection("refused".into());
        assert!(!should_retry(&state(0), Outcome::Failure(&conn), &policy).retry);
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        let resp = Response::new(StatusCode::SERVICE_UNAVAILABLE, headers, "");

        let ignoring = RetryPolicy::default();
        assert_eq!(
            should_retry(&state(0), Outcome::Response(&resp), &ignoring).delay,
            Duration::from_millis(200)
        );

        let respecting = RetryPolicy::default().with_respect_retry_after(true);
        assert_eq!(
            should_retry(&state(0), Outcome::Response(&resp), &respecting).delay,
            Duration::from_secs(7)
        );
    }

    #[test]
    fn test_full_jitter_stays_in_range() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(100))
            .with_jitter(Jitter::Full);
        let conn = PulsewireError::Connection("x".into());
        for _ in 0..100 {
            let d = should_retry(&state(1), Outcome::Failure(&conn), &policy).delay;
            assert!(d <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_validate_multiplier() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::default().with_multiplier(0.5).validate().is_err());
        assert!(RetryPolicy::default().with_multiplier(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_attempt_state_advance() {
        let mut s = AttemptState::new();
        s.advance(Duration::from_millis(10));
        s.advance(Duration::from_millis(20));
        assert_eq!(s.attempt_number, 2);
        assert_eq!(s.elapsed_delay, Duration::from_millis(30));
    }
}
