//! Randomness for trace identifiers and schedule jitter.
//!
//! Runs with a configured seed use [`SeededRng`] and are reproducible.
//! Every other run draws from [`EntropyRng`].

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Random number source.
///
/// Seeded implementations make trace ids and jittered delays reproducible
/// in tests.
pub trait Rng: Send {
    fn next_u64(&mut self) -> u64;

    fn next_u128(&mut self) -> u128 {
        (u128::from(self.next_u64()) << 64) | u128::from(self.next_u64())
    }

    /// Uniform value in `[0, bound)`. Modulo-biased, which is fine for jitter.
    fn next_u64_bounded(&mut self, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        self.next_u64() % bound
    }

    /// Spread `base` by up to `fraction` in either direction.
    fn jitter(&mut self, base: Duration, fraction: f64) -> Duration {
        if fraction <= 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * fraction.min(1.0);
        let unit = self.next_u64_bounded(1_000_001) as f64 / 1_000_000.0;
        let offset = spread * (2.0 * unit - 1.0);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }
}

/// Xorshift64 generator with shifts (13, 7, 17).
///
/// ```
/// use weft_types::{Rng, SeededRng};
///
/// let mut a = SeededRng::new(7);
/// let mut b = SeededRng::new(7);
/// assert_eq!(a.next_u64(), b.next_u64());
/// ```
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    /// A seed of 0 is replaced with 1; xorshift needs non-zero state.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }
}

impl Rng for SeededRng {
    fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }
}

/// Operating-system seeded generator for unseeded runs.
#[derive(Debug)]
pub struct EntropyRng {
    inner: StdRng,
}

impl EntropyRng {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: StdRng::from_entropy(),
        }
    }
}

impl Default for EntropyRng {
    fn default() -> Self {
        Self::new()
    }
}

impl Rng for EntropyRng {
    fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    fn next_u128(&mut self) -> u128 {
        let mut bytes = [0_u8; 16];
        self.inner.fill_bytes(&mut bytes);
        u128::from_le_bytes(bytes)
    }
}
