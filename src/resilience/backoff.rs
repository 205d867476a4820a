//! # Exponential Backoff
//!
//! Stateless delay calculator pacing reconnect attempts.
//!
//! `delay(n) = min(base * multiplier^n, max_delay)`, perturbed by uniform
//! jitter of `±jitter_fraction` and floored at `min_delay` so a retry loop
//! can never spin.

use rand::Rng;
use std::time::{Duration, Instant};

use crate::config::RetryConfig;

/// Absolute floor applied even when `min_delay` is configured as zero
const MIN_POSITIVE_DELAY: Duration = Duration::from_millis(1);

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
    pub min_delay: Duration,
}

impl ExponentialBackoff {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base: config.reconnect_interval(),
            multiplier: config.backoff_multiplier,
            max_delay: config.max_backoff_delay(),
            jitter_fraction: config.jitter_fraction,
            min_delay: config.min_delay(),
        }
    }

    /// Capped delay before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        if raw.is_finite() {
            Duration::from_secs_f64(raw.min(max).max(0.0))
        } else {
            self.max_delay
        }
    }

    /// Jittered delay for the given attempt count
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.next_delay_with(attempt, &mut rand::thread_rng())
    }

    /// Jittered delay drawing jitter from `rng`
    pub fn next_delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay(attempt).as_secs_f64();
        let jitter = if self.jitter_fraction > 0.0 {
            delay * self.jitter_fraction * rng.gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        let floor = self.min_delay.max(MIN_POSITIVE_DELAY).as_secs_f64();
        Duration::from_secs_f64((delay + jitter).max(floor))
    }

    /// Whether `delay` has elapsed since `last_attempt`
    pub fn is_due(now: Instant, last_attempt: Option<Instant>, delay: Duration) -> bool {
        match last_attempt {
            Some(at) => now.saturating_duration_since(at) >= delay,
            None => true,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_default_matches_retry_defaults() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.base, Duration::from_secs(5));
        assert_eq!(backoff.multiplier, 2.0);
        assert_eq!(backoff.max_delay, Duration::from_secs(60));
        assert_eq!(backoff.min_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_base_delay_doubles_until_cap() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.base_delay(0), Duration::from_secs(5));
        assert_eq!(backoff.base_delay(1), Duration::from_secs(10));
        assert_eq!(backoff.base_delay(2), Duration::from_secs(20));
        assert_eq!(backoff.base_delay(3), Duration::from_secs(40));
        assert_eq!(backoff.base_delay(4), Duration::from_secs(60));
        assert_eq!(backoff.base_delay(50), Duration::from_secs(60));
    }

    #[test]
    fn test_base_delay_handles_huge_attempts() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.base_delay(u32::MAX), backoff.max_delay);
    }

    #[test]
    fn test_base_delay_is_monotonic() {
        let backoff = ExponentialBackoff::default();
        for n in 0..40 {
            assert!(backoff.base_delay(n) <= backoff.base_delay(n + 1), "attempt {}", n);
        }
    }

    #[test]
    fn test_jittered_delay_monotonic_below_cap() {
        // multiplier 2 with 10% jitter: 1.1 * d < 0.9 * 2d, so ordering holds below the cap
        let backoff = ExponentialBackoff::default();
        let mut rng = StdRng::seed_from_u64(7);
        for n in 0..3 {
            for _ in 0..100 {
                let a = backoff.next_delay_with(n, &mut rng);
                let b = backoff.next_delay_with(n + 1, &mut rng);
                assert!(a <= b, "attempt {}: {:?} > {:?}", n, a, b);
            }
        }
    }

    #[test]
    fn test_jittered_delay_bounded_by_cap() {
        let backoff = ExponentialBackoff::default();
        let bound = backoff.max_delay.as_secs_f64() * (1.0 + backoff.jitter_fraction);
        let mut rng = StdRng::seed_from_u64(11);
        for n in 0..64 {
            let delay = backoff.next_delay_with(n, &mut rng).as_secs_f64();
            assert!(delay <= bound + 1e-9, "attempt {} delay {}", n, delay);
        }
    }

    #[test]
    fn test_jitter_stays_within_fraction() {
        let backoff = ExponentialBackoff::default();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let delay = backoff.next_delay_with(1, &mut rng).as_secs_f64();
            assert!((9.0..=11.0).contains(&delay), "delay {}", delay);
        }
    }

    #[test]
    fn test_delay_never_below_floor() {
        let backoff = ExponentialBackoff {
            base: Duration::ZERO,
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            jitter_fraction: 0.5,
            min_delay: Duration::from_millis(250),
        };
        for n in 0..10 {
            assert!(backoff.next_delay(n) >= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_zero_min_delay_still_positive() {
        let backoff = ExponentialBackoff {
            base: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter_fraction: 0.0,
            min_delay: Duration::ZERO,
        };
        assert!(backoff.next_delay(0) > Duration::ZERO);
    }

    #[test]
    fn test_is_due() {
        let now = Instant::now();
        assert!(ExponentialBackoff::is_due(now, None, Duration::from_secs(5)));
        assert!(!ExponentialBackoff::is_due(now, Some(now), Duration::from_secs(5)));
        assert!(ExponentialBackoff::is_due(now + Duration::from_secs(5), Some(now), Duration::from_secs(5)));
    }
}
