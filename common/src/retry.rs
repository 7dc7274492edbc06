// Backoff policy for failed runs.
//
// How many retries a job gets is recorded on the job row itself
// (max_retries); this module only decides how long a parked job waits
// before its next attempt becomes due.

use rand::Rng;
use std::time::Duration;

/// Spacing policy between a failed run and the attempt after it.
pub trait RetryStrategy: Send + Sync {
    /// Delay before retry number `retry_count` (0-based)
    fn delay_for(&self, retry_count: u32) -> Duration;
}

/// Doubling backoff with additive jitter.
///
/// Delays run 5s, 10s, 20s, ... from the configured base, capped at the
/// configured maximum, with up to `jitter` of the pre-jitter delay
/// added at random on top.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_secs: u64,
    cap_secs: u64,
    jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_secs: 5,
            cap_secs: 1800,
            jitter: 0.1,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a strategy from settings values; the jitter factor is
    /// clamped into [0.0, 1.0].
    pub fn with_config(base_delay_secs: u64, max_delay_secs: u64, jitter_factor: f64) -> Self {
        Self {
            base_secs: base_delay_secs,
            cap_secs: max_delay_secs,
            jitter: jitter_factor.clamp(0.0, 1.0),
        }
    }

    fn capped_secs(&self, retry_count: u32) -> u64 {
        self.base_secs
            .saturating_mul(2_u64.saturating_pow(retry_count))
            .min(self.cap_secs)
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn delay_for(&self, retry_count: u32) -> Duration {
        let base_ms = self.capped_secs(retry_count).saturating_mul(1000);
        let spread_ms = (base_ms as f64 * self.jitter) as u64;
        let extra_ms = if spread_ms > 0 {
            rand::thread_rng().gen_range(0..=spread_ms)
        } else {
            0
        };
        Duration::from_millis(base_ms.saturating_add(extra_ms))
    }
}

/// Constant spacing between attempts, used where tests need
/// deterministic timing.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl RetryStrategy for FixedDelay {
    fn delay_for(&self, _retry_count: u32) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_up_to_the_cap() {
        // Jitter off for determinism.
        let strategy = ExponentialBackoff::with_config(5, 1800, 0.0);

        let secs: Vec<u64> = (0..5).map(|n| strategy.delay_for(n).as_secs()).collect();
        assert_eq!(secs, vec![5, 10, 20, 40, 80]);

        // 5 * 2^9 = 2560 would pass the cap.
        assert_eq!(strategy.delay_for(9).as_secs(), 1800);
    }

    #[test]
    fn test_large_retry_count_does_not_overflow() {
        let strategy = ExponentialBackoff::with_config(5, 1800, 0.0);
        assert_eq!(strategy.delay_for(u32::MAX).as_secs(), 1800);
    }

    #[test]
    fn test_jitter_stays_within_bounds_and_varies() {
        let strategy = ExponentialBackoff::new();

        let delays: Vec<u128> = (0..20).map(|_| strategy.delay_for(0).as_millis()).collect();

        // 20 draws over a 500ms spread virtually never all collide.
        assert!(
            delays.iter().any(|&d| d != delays[0]),
            "all {} sampled delays came out at {}ms",
            delays.len(),
            delays[0]
        );
        for delay in delays {
            assert!(
                (5000..=5500).contains(&delay),
                "delay {}ms outside the jittered range for the first retry",
                delay
            );
        }
    }

    #[test]
    fn test_settings_sized_strategy() {
        let strategy = ExponentialBackoff::with_config(10, 3600, 0.2);

        let secs = strategy.delay_for(0).as_secs();
        assert!(
            (10..=12).contains(&secs),
            "delay {}s outside 10s base plus 20% jitter",
            secs
        );
    }

    #[test]
    fn test_jitter_factor_is_clamped() {
        assert_eq!(ExponentialBackoff::with_config(5, 1800, -0.5).jitter, 0.0);
        assert_eq!(ExponentialBackoff::with_config(5, 1800, 1.5).jitter, 1.0);
        assert_eq!(ExponentialBackoff::with_config(5, 1800, 0.5).jitter, 0.5);
    }

    #[test]
    fn test_fixed_delay_ignores_retry_count() {
        let strategy = FixedDelay::new(Duration::from_secs(10));
        for retry_count in 0..10 {
            assert_eq!(strategy.delay_for(retry_count), Duration::from_secs(10));
        }
    }
}
