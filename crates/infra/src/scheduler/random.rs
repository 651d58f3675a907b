//! Jitter sources.

use std::time::Duration;

use rand::Rng;

/// Source of random delays, injected so backoff and tick jitter are testable.
pub trait RandomSource: Send + Sync + core::fmt::Debug {
    /// A delay in `[0, bound)`; zero when `bound` is zero.
    fn jitter(&self, bound: Duration) -> Duration;
}

/// Thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn jitter(&self, bound: Duration) -> Duration {
        let nanos = u64::try_from(bound.as_nanos()).unwrap_or(u64::MAX);
        if nanos == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
    }
}

/// Always returns the same fraction of the bound (0.0 = no jitter).
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn jitter(&self, bound: Duration) -> Duration {
        bound.mul_f64(self.0.clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_random_stays_below_bound() {
        let bound = Duration::from_millis(10);
        for _ in 0..1000 {
            assert!(ThreadRandom.jitter(bound) < bound);
        }
        assert_eq!(ThreadRandom.jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn fixed_random_is_deterministic() {
        assert_eq!(FixedRandom(0.5).jitter(Duration::from_secs(2)), Duration::from_secs(1));
        assert_eq!(FixedRandom::default().jitter(Duration::from_secs(2)), Duration::ZERO);
    }
}
