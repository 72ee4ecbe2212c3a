use std::time::Duration;

use crate::config::DeliveryConfig;

/// Exponential retry backoff with a ceiling and random jitter.
///
/// The jitter keeps competing workers from retrying a burst of failures in
/// lockstep after a provider outage.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter_cap: Duration,
}

impl BackoffPolicy {
    #[must_use]
    pub const fn new(base: Duration, max: Duration, jitter_cap: Duration) -> Self {
        Self {
            base,
            max,
            jitter_cap,
        }
    }

    #[must_use]
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(
            Duration::from_secs(config.base_retry_delay_secs),
            Duration::from_secs(config.max_retry_delay_secs),
            Duration::from_millis(config.retry_jitter_ms),
        )
    }

    /// Delay before the next try after `attempt` failed.
    ///
    /// `attempt` is 1-indexed: `next_delay(1)` is the wait after the first
    /// failure. The deterministic part is `min(max, base * 2^(attempt-1))`;
    /// a uniform jitter in `[0, jitter_cap]` is added on top.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max);

        let jitter_cap_ms = u64::try_from(self.jitter_cap.as_millis()).unwrap_or(u64::MAX);
        delay + Duration::from_millis(fastrand::u64(0..=jitter_cap_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_without_jitter() -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(30),
            Duration::from_secs(3600),
            Duration::ZERO,
        )
    }

    #[test]
    fn doubles_until_the_ceiling() {
        let policy = policy_without_jitter();

        assert_eq!(policy.next_delay(1), Duration::from_secs(30));
        assert_eq!(policy.next_delay(2), Duration::from_secs(60));
        assert_eq!(policy.next_delay(3), Duration::from_secs(120));
        // 30 * 2^7 = 3840 > 3600
        assert_eq!(policy.next_delay(8), Duration::from_secs(3600));
        assert_eq!(policy.next_delay(100), Duration::from_secs(3600));
    }

    #[test]
    fn never_shrinks_with_attempt_count() {
        let policy = policy_without_jitter();

        let mut previous = Duration::ZERO;
        for attempt in 1..=20 {
            let delay = policy.next_delay(attempt);
            assert!(delay >= previous, "delay shrank at attempt {attempt}");
            previous = delay;
        }
    }

    #[test]
    fn jitter_stays_within_its_cap() {
        let jitter_cap = Duration::from_millis(50);
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(8), jitter_cap);

        for attempt in 1..=10 {
            let delay = policy.next_delay(attempt);
            assert!(delay <= Duration::from_secs(8) + jitter_cap);
            assert!(delay >= Duration::from_secs(1));
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = policy_without_jitter();
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(3600));
    }
}
