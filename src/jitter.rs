//! Jitter applied to backoff delays to break retry synchronization.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy for retry delays.
///
/// `Full` picks uniformly in `[0, delay]`, then modulates the result by
/// `1 - ratio/2 + ratio * r` for a second uniform draw `r`, clamped so the
/// final value never exceeds the computed delay.
#[derive(Debug, Clone)]
pub enum Jitter {
    /// Use the exact backoff delay.
    None,
    /// Full jitter with a modulation ratio in `[0, 1]`.
    Full { ratio: f64 },
}

impl Jitter {
    pub fn full(ratio: f64) -> Self {
        Jitter::Full { ratio: ratio.clamp(0.0, 1.0) }
    }

    /// Apply jitter using the process RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-provided RNG (seeded in tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full { ratio } => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::ZERO;
                }
                let uniform = rng.random_range(0..=millis);
                let factor = 1.0 - ratio / 2.0 + ratio * rng.random::<f64>();
                let jittered = ((uniform as f64) * factor) as u64;
                Duration::from_millis(jittered.min(millis))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_returns_exact_delay() {
        assert_eq!(Jitter::None.apply(Duration::from_secs(2)), Duration::from_secs(2));
    }

    #[test]
    fn full_jitter_never_exceeds_delay() {
        let jitter = Jitter::full(0.3);
        let delay = Duration::from_secs(1);
        for _ in 0..200 {
            let jittered = jitter.apply(delay);
            assert!(jittered <= delay);
        }
    }

    #[test]
    fn full_jitter_is_deterministic_with_seeded_rng() {
        let jitter = Jitter::full(0.3);
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let delay = Duration::from_millis(800);
        assert_eq!(jitter.apply_with_rng(delay, &mut a), jitter.apply_with_rng(delay, &mut b));
    }

    #[test]
    fn ratio_is_clamped() {
        let jitter = Jitter::full(5.0);
        match jitter {
            Jitter::Full { ratio } => assert_eq!(ratio, 1.0),
            Jitter::None => panic!("expected full jitter"),
        }
    }

    #[test]
    fn zero_delay_stays_zero() {
        assert_eq!(Jitter::full(0.3).apply(Duration::ZERO), Duration::ZERO);
    }
}
