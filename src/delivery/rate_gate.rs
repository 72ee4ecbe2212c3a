use std::time::Duration;

use tokio::{
    sync::Mutex,
    time::{sleep_until, Instant},
};

/// Process-local pacing of outbound sends.
///
/// Each `acquire` reserves the next send slot, at least one interval after
/// the previous one, and sleeps until that slot arrives. Reservation
/// happens under a fair async mutex, so slots are granted strictly in the
/// order `acquire` was called no matter how many handlers contend. This
/// bounds throughput to the provider's accepted rate even when batch size
/// and handler concurrency are configured far above it.
#[derive(Debug)]
pub struct RateGate {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateGate {
    /// A gate allowing `rate_per_second` sends; 0 disables pacing.
    #[must_use]
    pub fn per_second(rate_per_second: u32) -> Self {
        let interval = if rate_per_second == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(1000 / u64::from(rate_per_second))
        };
        Self::with_interval(interval)
    }

    #[must_use]
    pub const fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::const_new(None),
        }
    }

    /// Block until the next send slot is available and reserve it.
    pub async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }

        let slot = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next_slot {
                Some(at) if at > now => at,
                _ => now,
            };
            *next_slot = Some(slot + self.interval);
            slot
        };

        sleep_until(slot).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::future::join_all;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn spaces_sequential_acquires_by_the_interval() {
        let gate = RateGate::with_interval(Duration::from_millis(100));
        let start = Instant::now();

        for _ in 0..5 {
            gate.acquire().await;
        }

        // First slot is immediate, the remaining four are spaced out
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn bounds_concurrent_handlers_to_the_target_rate() {
        let gate = Arc::new(RateGate::with_interval(Duration::from_millis(50)));
        let start = Instant::now();

        // Far more concurrency than the rate allows
        let handlers: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                tokio::spawn(async move {
                    gate.acquire().await;
                    start.elapsed()
                })
            })
            .collect();

        let mut grants: Vec<Duration> = join_all(handlers)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        grants.sort();

        // 8 grants cannot complete faster than 7 full intervals
        assert!(grants[7] >= Duration::from_millis(350));
        // No two grants share a slot
        for pair in grants.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(50));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_disables_pacing() {
        let gate = RateGate::per_second(0);
        let start = Instant::now();

        for _ in 0..100 {
            gate.acquire().await;
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
