//! Retry accounting for one job.
//!
//! [`RetryManager`] counts complete failures (no records committed) and
//! partial failures (some progress) separately. Successive counters reset
//! whenever the other kind of failure happens; totals only grow. Whether a
//! retry is allowed and how long to back off are derived from those counters
//! and a [`RetryPolicy`] that comes from configuration, never from storage.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use syncpilot_types::RetryCounters;

const DEFAULT_SUCCESSIVE_COMPLETE_FAILURE_LIMIT: u32 = 5;
const DEFAULT_SUCCESSIVE_PARTIAL_FAILURE_LIMIT: u32 = 1000;
const DEFAULT_MIN_BACKOFF_SECS: u64 = 10;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 30 * 60;
const DEFAULT_BACKOFF_BASE: u32 = 3;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Exponential backoff curve applied to successive complete failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub base: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_interval_secs: DEFAULT_MIN_BACKOFF_SECS,
            max_interval_secs: DEFAULT_MAX_BACKOFF_SECS,
            base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl BackoffPolicy {
    /// Backoff after `failures` successive failures.
    ///
    /// Zero for no failures, then `min × base^(failures − 1)` capped at `max`.
    #[must_use]
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = u64::from(self.base.max(1)).saturating_pow(failures - 1);
        let secs = self.min_interval_secs.saturating_mul(factor).min(self.max_interval_secs);
        Duration::from_secs(secs)
    }
}

/// Caps and backoff curve for a [`RetryManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub successive_complete_failure_limit: u32,
    pub successive_partial_failure_limit: u32,
    /// Optional cap on all complete failures of the job.
    pub total_complete_failure_limit: Option<u32>,
    /// Optional cap on all partial failures of the job.
    pub total_partial_failure_limit: Option<u32>,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            successive_complete_failure_limit: DEFAULT_SUCCESSIVE_COMPLETE_FAILURE_LIMIT,
            successive_partial_failure_limit: DEFAULT_SUCCESSIVE_PARTIAL_FAILURE_LIMIT,
            total_complete_failure_limit: None,
            total_partial_failure_limit: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Failure counters of a job plus the policy that interprets them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryManager {
    policy: RetryPolicy,
    counters: RetryCounters,
}

impl RetryManager {
    /// An empty manager.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, counters: RetryCounters::default() }
    }

    /// A manager resumed from persisted counters.
    #[must_use]
    pub fn hydrate(policy: RetryPolicy, counters: RetryCounters) -> Self {
        Self { policy, counters }
    }

    /// Record a failed attempt.
    pub fn increment_failure(&mut self, made_progress: bool) {
        let c = &mut self.counters;
        if made_progress {
            c.successive_partial_failures = c.successive_partial_failures.saturating_add(1);
            c.total_partial_failures = c.total_partial_failures.saturating_add(1);
            c.successive_complete_failures = 0;
        } else {
            c.successive_complete_failures = c.successive_complete_failures.saturating_add(1);
            c.total_complete_failures = c.total_complete_failures.saturating_add(1);
            c.successive_partial_failures = 0;
        }
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub fn should_retry(&self) -> bool {
        let p = &self.policy;
        let c = &self.counters;
        c.successive_complete_failures < p.successive_complete_failure_limit
            && c.successive_partial_failures < p.successive_partial_failure_limit
            && p.total_complete_failure_limit.map_or(true, |cap| c.total_complete_failures < cap)
            && p.total_partial_failure_limit.map_or(true, |cap| c.total_partial_failures < cap)
    }

    /// How long to wait before the next attempt.
    #[must_use]
    pub fn backoff(&self) -> Duration {
        self.policy.backoff.backoff(self.counters.successive_complete_failures)
    }

    #[must_use]
    pub fn counters(&self) -> RetryCounters {
        self.counters
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[must_use]
    pub fn successive_complete_failures(&self) -> u32 {
        self.counters.successive_complete_failures
    }

    #[must_use]
    pub fn total_complete_failures(&self) -> u32 {
        self.counters.total_complete_failures
    }

    #[must_use]
    pub fn successive_partial_failures(&self) -> u32 {
        self.counters.successive_partial_failures
    }

    #[must_use]
    pub fn total_partial_failures(&self) -> u32 {
        self.counters.total_partial_failures
    }
}

impl fmt::Display for RetryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        write!(
            f,
            "successive complete failures: {}/{}, total complete failures: {}, \
             successive partial failures: {}/{}, total partial failures: {}, backoff: {}",
            c.successive_complete_failures,
            self.policy.successive_complete_failure_limit,
            c.total_complete_failures,
            c.successive_partial_failures,
            self.policy.successive_partial_failure_limit,
            c.total_partial_failures,
            format_duration(self.backoff()),
        )
    }
}

/// Human readable duration such as `1h 5m 3s`.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    if total == 0 {
        return if d.is_zero() { "0s".to_string() } else { format!("{}ms", d.as_millis()) };
    }
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut parts = Vec::new();
    if h > 0 {
        parts.push(format!("{h}h"));
    }
    if m > 0 {
        parts.push(format!("{m}m"));
    }
    if s > 0 {
        parts.push(format!("{s}s"));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capped(complete: u32, partial: u32) -> RetryPolicy {
        RetryPolicy {
            successive_complete_failure_limit: complete,
            successive_partial_failure_limit: partial,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_increment_complete_resets_successive_partial() {
        let mut mgr = RetryManager::new(RetryPolicy::default());
        mgr.increment_failure(true);
        mgr.increment_failure(true);
        mgr.increment_failure(false);

        assert_eq!(mgr.successive_partial_failures(), 0);
        assert_eq!(mgr.total_partial_failures(), 2);
        assert_eq!(mgr.successive_complete_failures(), 1);
        assert_eq!(mgr.total_complete_failures(), 1);
    }

    #[test]
    fn test_increment_partial_resets_successive_complete() {
        let mut mgr = RetryManager::new(RetryPolicy::default());
        mgr.increment_failure(false);
        mgr.increment_failure(false);
        mgr.increment_failure(true);

        assert_eq!(mgr.successive_complete_failures(), 0);
        assert_eq!(mgr.total_complete_failures(), 2);
        assert_eq!(mgr.successive_partial_failures(), 1);
    }

    #[test]
    fn test_should_retry_complete_boundary() {
        let mut mgr = RetryManager::new(capped(3, 5));
        for _ in 0..3 {
            assert!(mgr.should_retry());
            mgr.increment_failure(false);
        }
        assert_eq!(mgr.successive_complete_failures(), 3);
        assert!(!mgr.should_retry());
    }

    #[test]
    fn test_should_retry_partial_boundary() {
        let mut mgr = RetryManager::new(capped(3, 5));
        for _ in 0..5 {
            assert!(mgr.should_retry());
            mgr.increment_failure(true);
        }
        assert!(!mgr.should_retry());
    }

    #[test]
    fn test_total_caps_are_optional() {
        let policy = RetryPolicy { total_complete_failure_limit: Some(2), ..capped(10, 10) };
        let mut mgr = RetryManager::new(policy);
        mgr.increment_failure(false);
        mgr.increment_failure(true);
        assert!(mgr.should_retry());
        mgr.increment_failure(false);
        assert_eq!(mgr.successive_complete_failures(), 1);
        assert!(!mgr.should_retry());
    }

    #[test]
    fn test_backoff_curve() {
        let policy = BackoffPolicy { min_interval_secs: 10, max_interval_secs: 100, base: 3 };
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_secs(10));
        assert_eq!(policy.backoff(2), Duration::from_secs(30));
        assert_eq!(policy.backoff(3), Duration::from_secs(90));
        assert_eq!(policy.backoff(4), Duration::from_secs(100));
        assert_eq!(policy.backoff(200), Duration::from_secs(100));
    }

    #[test]
    fn test_partial_failures_do_not_back_off() {
        let mut mgr = RetryManager::new(RetryPolicy::default());
        mgr.increment_failure(true);
        assert_eq!(mgr.backoff(), Duration::ZERO);
        mgr.increment_failure(false);
        assert_eq!(mgr.backoff(), Duration::from_secs(10));
    }

    #[test]
    fn test_hydrate_keeps_counters() {
        let counters = RetryCounters {
            successive_complete_failures: 2,
            total_complete_failures: 4,
            successive_partial_failures: 0,
            total_partial_failures: 1,
        };
        let mgr = RetryManager::hydrate(RetryPolicy::default(), counters);
        assert_eq!(mgr.counters(), counters);
    }

    #[test]
    fn test_display_mentions_counters_and_backoff() {
        let mut mgr = RetryManager::new(capped(3, 5));
        mgr.increment_failure(false);
        let text = mgr.to_string();
        assert!(text.contains("successive complete failures: 1/3"), "{text}");
        assert!(text.contains("backoff: 10s"), "{text}");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 2m 3s");
        assert_eq!(format_duration(Duration::from_secs(600)), "10m");
    }
}
