//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Backoff curve: `base * multiplier^(n-1)`, capped, then jittered by `±jitter`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Growth factor per retry.
    pub multiplier: f64,
    /// Upper bound on the un-jittered delay.
    pub cap: Duration,
    /// Jitter as a fraction of the delay, in `[0.0, 1.0]`.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            multiplier: 2.0,
            cap: Duration::from_millis(1000),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Backoff without jitter, for deterministic schedules.
    pub fn fixed_curve(base: Duration, multiplier: f64, cap: Duration) -> Self {
        Self {
            base,
            multiplier,
            cap,
            jitter: 0.0,
        }
    }

    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn nominal(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(64) as i32;
        let raw = self.base.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        let capped = raw.min(self.cap.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Jittered delay before retry number `retry` (1-based).
    ///
    /// Never exceeds `cap * (1 + jitter)`.
    pub fn delay(&self, retry: u32) -> Duration {
        let nominal = self.nominal(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || nominal.is_zero() {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        nominal.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_curve_doubles_then_caps() {
        let backoff = Backoff::fixed_curve(
            Duration::from_millis(50),
            2.0,
            Duration::from_millis(300),
        );
        assert_eq!(backoff.nominal(1), Duration::from_millis(50));
        assert_eq!(backoff.nominal(2), Duration::from_millis(100));
        assert_eq!(backoff.nominal(3), Duration::from_millis(200));
        assert_eq!(backoff.nominal(4), Duration::from_millis(300));
        assert_eq!(backoff.nominal(40), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let backoff = Backoff::default();
        for retry in 1..10 {
            let nominal = backoff.nominal(retry);
            let delay = backoff.delay(retry);
            assert!(delay >= nominal.mul_f64(0.8) - Duration::from_micros(1));
            assert!(delay <= nominal.mul_f64(1.2) + Duration::from_micros(1));
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let backoff = Backoff::fixed_curve(Duration::from_millis(10), 3.0, Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_millis(90));
    }
}
