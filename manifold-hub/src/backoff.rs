//! Reconnect backoff math, kept pure so it can be tested without sleeping.

use std::time::Duration;

/// Backoff schedule parameters.
#[derive(Debug, Clone, Copy)]
pub struct BackoffSchedule {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    /// Symmetric jitter fraction, e.g. 0.2 for ±20%.
    pub jitter: f64,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl BackoffSchedule {
    /// Deterministic delay before the `n`-th retry (n counted from 1),
    /// before jitter.
    pub fn raw_delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exp = (consecutive_failures - 1).min(32);
        let secs = self.base.as_secs_f64() * self.factor.powi(exp as i32);
        Duration::from_secs_f64(secs.min(self.cap.as_secs_f64()))
    }

    /// Jittered delay before the `n`-th retry.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let raw = self.raw_delay(consecutive_failures);
        if raw.is_zero() || self.jitter <= 0.0 {
            return raw;
        }
        let spread = 1.0 + self.jitter * (rand::random::<f64>() * 2.0 - 1.0);
        Duration::from_secs_f64(raw.as_secs_f64() * spread)
    }
}

/// Delay with the hub's standard schedule: base 1 s, factor 2, cap 60 s,
/// jitter ±20%.
pub fn retry_delay(consecutive_failures: u32) -> Duration {
    BackoffSchedule::default().delay(consecutive_failures)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_delay_doubles_up_to_the_cap() {
        let schedule = BackoffSchedule::default();
        assert_eq!(schedule.raw_delay(1), Duration::from_secs(1));
        assert_eq!(schedule.raw_delay(2), Duration::from_secs(2));
        assert_eq!(schedule.raw_delay(3), Duration::from_secs(4));
        assert_eq!(schedule.raw_delay(7), Duration::from_secs(60));
        assert_eq!(schedule.raw_delay(30), Duration::from_secs(60));
    }

    #[test]
    fn zero_failures_means_no_delay() {
        assert_eq!(BackoffSchedule::default().raw_delay(0), Duration::ZERO);
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let schedule = BackoffSchedule::default();
        for _ in 0..200 {
            let delay = schedule.delay(3).as_secs_f64();
            assert!((3.2..=4.8).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn huge_failure_counts_do_not_overflow() {
        let schedule = BackoffSchedule::default();
        assert_eq!(schedule.raw_delay(u32::MAX), Duration::from_secs(60));
    }
}
