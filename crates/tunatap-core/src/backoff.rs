//! `BackoffPolicy` (C2) — deterministic jittered exponential backoff with an
//! attempt cap. A pure function of the attempt count plus its config; no
//! wall-clock dependency, so it is fully unit-testable.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter_fraction: f64,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Profile for bastion-session acquisition retries: slow, patient.
    pub fn bastion_retry() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(120),
            multiplier: 1.5,
            jitter_fraction: 0.3,
            max_attempts: 15,
        }
    }

    /// Profile for listener-accept failures: fast, aggressive.
    pub fn accept_retry() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
            multiplier: 2.0,
            jitter_fraction: 0.2,
            max_attempts: 10,
        }
    }

    /// Base delay (pre-jitter) for a given attempt, clamped to `max`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }

    /// `(delay, should_retry)` for the given 0-indexed attempt, using `rng`
    /// for the jitter draw.
    pub fn next_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> (Duration, bool) {
        let base = self.base_delay(attempt);
        let jitter = rng.gen_range(-self.jitter_fraction..=self.jitter_fraction);
        let factor = (1.0 + jitter).max(0.0);
        let delay = Duration::from_secs_f64(base.as_secs_f64() * factor);
        let should_retry = attempt < self.max_attempts;
        (delay, should_retry)
    }

    /// Convenience wrapper using the thread-local RNG.
    pub fn next(&self, attempt: u32) -> (Duration, bool) {
        self.next_with_rng(attempt, &mut rand::thread_rng())
    }

    /// Bounds `[base*(1-jitter), base*(1+jitter)]` for the given attempt,
    /// used by tests asserting I10.
    pub fn bounds(&self, attempt: u32) -> (Duration, Duration) {
        let base = self.base_delay(attempt).as_secs_f64();
        let lo = (base * (1.0 - self.jitter_fraction)).max(0.0);
        let hi = base * (1.0 + self.jitter_fraction);
        (Duration::from_secs_f64(lo), Duration::from_secs_f64(hi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha_local::ChaCha8Rng;

    // A tiny local PRNG so these tests don't depend on an extra workspace
    // crate just for deterministic seeding; see module below.
    mod rand_chacha_local {
        use rand::{Error, RngCore, SeedableRng};

        /// Minimal splitmix64-based deterministic RNG, used only in tests.
        pub struct ChaCha8Rng(u64);

        impl SeedableRng for ChaCha8Rng {
            type Seed = [u8; 8];
            fn from_seed(seed: Self::Seed) -> Self {
                ChaCha8Rng(u64::from_le_bytes(seed))
            }
        }

        impl RngCore for ChaCha8Rng {
            fn next_u32(&mut self) -> u32 {
                (self.next_u64() >> 32) as u32
            }
            fn next_u64(&mut self) -> u64 {
                self.0 = self.0.wrapping_add(0x9E3779B97F4A7C15);
                let mut z = self.0;
                z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
                z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
                z ^ (z >> 31)
            }
            fn fill_bytes(&mut self, dest: &mut [u8]) {
                for chunk in dest.chunks_mut(8) {
                    let bytes = self.next_u64().to_le_bytes();
                    chunk.copy_from_slice(&bytes[..chunk.len()]);
                }
            }
            fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
                self.fill_bytes(dest);
                Ok(())
            }
        }
    }

    #[test]
    fn bastion_retry_profile_bounds_widen_with_each_attempt() {
        let policy = BackoffPolicy::bastion_retry();
        let (lo0, hi0) = policy.bounds(0);
        let (lo1, hi1) = policy.bounds(1);
        let (lo2, hi2) = policy.bounds(2);

        assert!(lo0.as_secs_f64() >= 5.0 && hi0.as_secs_f64() <= 6.5);
        assert!(lo1.as_secs_f64() >= 7.5 && hi1.as_secs_f64() <= 9.75);
        assert!(lo2.as_secs_f64() >= 11.25 && hi2.as_secs_f64() <= 14.625);
    }

    #[test]
    fn delay_always_within_bounds() {
        let policy = BackoffPolicy::bastion_retry();
        let mut rng = ChaCha8Rng::from_seed(42u64.to_le_bytes());
        for attempt in 0..20 {
            let (delay, _) = policy.next_with_rng(attempt, &mut rng);
            let (lo, hi) = policy.bounds(attempt);
            assert!(
                delay >= lo && delay <= hi,
                "attempt {attempt}: delay {delay:?} not in [{lo:?}, {hi:?}]"
            );
        }
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = BackoffPolicy::bastion_retry();
        let mut rng = ChaCha8Rng::from_seed(1u64.to_le_bytes());
        let (_, retry_ok) = policy.next_with_rng(14, &mut rng);
        assert!(retry_ok);
        let (_, retry_fail) = policy.next_with_rng(15, &mut rng);
        assert!(!retry_fail);
    }

    #[test]
    fn delay_caps_at_max() {
        let policy = BackoffPolicy::bastion_retry();
        let base = policy.base_delay(100);
        assert_eq!(base, policy.max);
    }

    #[test]
    fn accept_retry_is_faster_than_bastion_retry() {
        let accept = BackoffPolicy::accept_retry();
        let bastion = BackoffPolicy::bastion_retry();
        assert!(accept.initial < bastion.initial);
        assert!(accept.max < bastion.max);
    }
}
