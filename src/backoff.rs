//! Delay schedules for retry attempts.

use std::time::Duration;

/// Delay schedule between retry attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between attempts.
    Constant { delay: Duration },
    /// Doubling delay, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential { base, max }
    }

    /// Delay before retry number `attempt` (1-indexed: the wait after the
    /// first failed attempt is `delay(1)`).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { base, max } => {
                let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
                let raw = base.checked_mul(multiplier).unwrap_or(Duration::MAX);
                raw.min(*max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_schedule_is_flat() {
        let backoff = Backoff::constant(Duration::from_millis(250));
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(7), Duration::from_millis(250));
    }

    #[test]
    fn exponential_schedule_doubles() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_secs(30));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_schedule_caps_at_max() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
        assert_eq!(backoff.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn exponential_schedule_survives_huge_attempt_numbers() {
        let backoff = Backoff::exponential(Duration::from_secs(1), Duration::from_secs(300));
        assert_eq!(backoff.delay(64), Duration::from_secs(300));
    }
}
