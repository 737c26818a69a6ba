//! Retry delay computation.
//!
//! [`compute_backoff`] is the deterministic ceiling; [`jittered_backoff`]
//! draws the actual delay below that ceiling so that tasks failing together
//! do not retry together.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Exponential backoff ceiling: `base_ms * 2^(attempt-1)`, clamped to `max_backoff_ms`.
///
/// `attempt` is 1-indexed; 0 is treated as 1. Non-decreasing in `attempt`
/// and never above `max_backoff_ms`.
pub fn compute_backoff(attempt: u32, base_ms: u64, max_backoff_ms: u64) -> u64 {
    let exponent = attempt.max(1) - 1;
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(max_backoff_ms)
}

/// Backoff with jitter.
///
/// The result lies in `[max(min(base, ceiling), ceiling * (1 - jitter)), ceiling]`,
/// so it never drops below `base_ms` nor exceeds the ceiling. `jitter` is
/// clamped to `0.0..=1.0`.
pub fn jittered_backoff<R: Rng>(
    attempt: u32,
    base_ms: u64,
    max_backoff_ms: u64,
    jitter: f64,
    rng: &mut R,
) -> u64 {
    let ceiling = compute_backoff(attempt, base_ms, max_backoff_ms);
    let jitter = jitter.clamp(0.0, 1.0);

    let shaved = (ceiling as f64 * (1.0 - jitter)).floor() as u64;
    let floor = shaved.max(base_ms.min(ceiling));
    if floor >= ceiling {
        return ceiling;
    }
    rng.gen_range(floor..=ceiling)
}

/// Stateful backoff used by the queue server.
#[derive(Debug)]
pub struct Backoff {
    base_ms: u64,
    max_backoff_ms: u64,
    jitter: f64,
    rng: Mutex<StdRng>,
}

impl Backoff {
    /// Seeded from OS entropy.
    pub fn new(base_ms: u64, max_backoff_ms: u64, jitter: f64) -> Self {
        Self::from_rng(base_ms, max_backoff_ms, jitter, StdRng::from_entropy())
    }

    /// Deterministic sequence of delays for a given seed.
    pub fn seeded(base_ms: u64, max_backoff_ms: u64, jitter: f64, seed: u64) -> Self {
        Self::from_rng(base_ms, max_backoff_ms, jitter, StdRng::seed_from_u64(seed))
    }

    fn from_rng(base_ms: u64, max_backoff_ms: u64, jitter: f64, rng: StdRng) -> Self {
        Self {
            base_ms,
            max_backoff_ms,
            jitter,
            rng: Mutex::new(rng),
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = match self.rng.lock() {
            Ok(mut rng) => jittered_backoff(
                attempt,
                self.base_ms,
                self.max_backoff_ms,
                self.jitter,
                &mut *rng,
            ),
            // A poisoned rng still has a usable ceiling.
            Err(_) => compute_backoff(attempt, self.base_ms, self.max_backoff_ms),
        };
        Duration::from_millis(ms)
    }
}
