//! Exponential retry backoff with jitter.

use std::time::Duration;

use rand::Rng;

use relay_core::DispatchConfig;

/// Fractional jitter applied around the nominal delay (±20%).
pub const JITTER: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    /// Un-jittered delay after `failures` failed attempts: `base * 2^(failures-1)`, capped.
    pub fn nominal(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// Jittered delay, never above the cap.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER);
        self.nominal(failures).mul_f64(factor).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Backoff {
        Backoff::from_config(&DispatchConfig::default())
    }

    #[test]
    fn nominal_doubles_until_cap() {
        let b = policy();
        assert_eq!(b.nominal(1), Duration::from_secs(1));
        assert_eq!(b.nominal(2), Duration::from_secs(2));
        assert_eq!(b.nominal(3), Duration::from_secs(4));
        assert_eq!(b.nominal(6), Duration::from_secs(32));
        assert_eq!(b.nominal(7), Duration::from_secs(60));
        assert_eq!(b.nominal(40), Duration::from_secs(60));
    }

    #[test]
    fn zero_failures_uses_base() {
        assert_eq!(policy().nominal(0), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let b = policy();
        for failures in 1..=8 {
            let nominal = b.nominal(failures);
            for _ in 0..200 {
                let d = b.delay(failures);
                assert!(d >= nominal.mul_f64(0.8), "{d:?} below range of {nominal:?}");
                assert!(d <= nominal.mul_f64(1.2), "{d:?} above range of {nominal:?}");
                assert!(d <= Duration::from_secs(60), "{d:?} exceeds cap");
            }
        }
    }
}
