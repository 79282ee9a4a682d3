//! Reconnection policy.
//!
//! [`ReconnectPolicy`] implements [`backoff::backoff::Backoff`] so it plugs into anything that
//! drives a `backoff` policy, while keeping the exact, jitter-free delays an
//! [`InstanceConfig`] asks for.

use std::time::Duration;

use backoff::backoff::Backoff;

use crate::config::{InstanceConfig, ReconnectStrategy};

/// Delay before the reconnection attempt numbered `attempt` (0-indexed).
///
/// [`ReconnectStrategy::ExponentialBackoff`] is uncapped: the only bound on growth is the
/// attempt budget. Values beyond [`Duration::MAX`] saturate.
#[must_use]
pub fn backoff_delay(strategy: ReconnectStrategy, base: Duration, attempt: u32) -> Duration {
    match strategy {
        ReconnectStrategy::FixedDelay => base,
        ReconnectStrategy::ExponentialBackoff => 2_u32
            .checked_pow(attempt)
            .and_then(|factor| base.checked_mul(factor))
            .unwrap_or(Duration::MAX),
    }
}

/// Attempt counter plus backoff function for one instance.
///
/// Each call to [`Backoff::next_backoff`] records one failed attempt. While fewer than
/// `max_attempts` have failed it yields the delay before the next one, numbered from the first
/// retry; once `max_attempts` have failed it yields `None`. [`Backoff::reset`] restores the full
/// budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    strategy: ReconnectStrategy,
    base_delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    #[must_use]
    pub const fn new(strategy: ReconnectStrategy, base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            strategy,
            base_delay,
            max_attempts,
            attempts: 0,
        }
    }

    /// Consecutive failed attempts since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

impl From<&InstanceConfig> for ReconnectPolicy {
    fn from(config: &InstanceConfig) -> Self {
        Self::new(
            config.reconnect_strategy,
            config.reconnect_delay,
            config.max_reconnect_attempts,
        )
    }
}

impl Backoff for ReconnectPolicy {
    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.is_exhausted() {
            return None;
        }

        Some(backoff_delay(
            self.strategy,
            self.base_delay,
            self.attempts - 1,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_each_attempt() {
        let base = Duration::from_millis(100);

        for n in 0..10 {
            assert_eq!(
                backoff_delay(ReconnectStrategy::ExponentialBackoff, base, n),
                base * 2_u32.pow(n),
                "attempt {n}"
            );
        }
    }

    #[test]
    fn fixed_delay_never_changes() {
        let base = Duration::from_secs(1);

        for n in [0, 1, 5, 31, 200] {
            assert_eq!(backoff_delay(ReconnectStrategy::FixedDelay, base, n), base);
        }
    }

    #[test]
    fn exponential_saturates_instead_of_overflowing() {
        let delay = backoff_delay(
            ReconnectStrategy::ExponentialBackoff,
            Duration::from_secs(1),
            64,
        );
        assert_eq!(delay, Duration::MAX);
    }

    #[test]
    fn policy_stops_after_max_failures() {
        let mut policy =
            ReconnectPolicy::new(ReconnectStrategy::ExponentialBackoff, Duration::from_secs(1), 4);

        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_backoff(), Some(Duration::from_secs(4)));
        assert!(!policy.is_exhausted());

        // Fourth failure exhausts the budget
        assert_eq!(policy.next_backoff(), None);
        assert!(policy.is_exhausted());
        assert_eq!(policy.attempts(), 4);
    }

    #[test]
    fn three_attempt_budget_schedules_two_retries() {
        let mut policy =
            ReconnectPolicy::new(ReconnectStrategy::FixedDelay, Duration::from_secs(1), 3);

        let delays: Vec<_> = std::iter::from_fn(|| policy.next_backoff()).collect();

        assert_eq!(delays, vec![Duration::from_secs(1); 2]);
        assert_eq!(policy.attempts(), 3);
    }

    #[test]
    fn reset_restores_budget() {
        let mut policy =
            ReconnectPolicy::new(ReconnectStrategy::FixedDelay, Duration::from_millis(10), 2);

        assert!(policy.next_backoff().is_some());
        assert!(policy.next_backoff().is_none());

        policy.reset();

        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.next_backoff(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn single_attempt_budget_never_retries() {
        let mut policy =
            ReconnectPolicy::new(ReconnectStrategy::FixedDelay, Duration::from_secs(1), 1);

        assert_eq!(policy.next_backoff(), None);
        assert_eq!(policy.attempts(), 1);
    }

    #[test]
    fn zero_budget_never_retries() {
        let mut policy =
            ReconnectPolicy::new(ReconnectStrategy::FixedDelay, Duration::from_secs(1), 0);

        assert_eq!(policy.next_backoff(), None);
    }
}
