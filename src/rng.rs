//! Pseudorandom numbers for generator patterns, random time vars and the
//! `shuffle` combinator.

use std::time::{SystemTime, UNIX_EPOCH};

/// A seedable PRNG. Not cryptographically secure, and not meant to be.
#[derive(Debug, Clone)]
pub struct Rng(oorandom::Rand64);

impl Default for Rng {
    fn default() -> Self {
        Self::new_with_seed(Self::generate_seed())
    }
}

impl Rng {
    /// The same seed always yields the same stream.
    pub fn new_with_seed(seed: u128) -> Self {
        Self(oorandom::Rand64::new(seed))
    }

    /// A fresh seed from the OS, or from the system clock if the OS source is
    /// unavailable.
    pub fn generate_seed() -> u128 {
        let mut bytes = [0u8; 16];
        match getrandom::getrandom(&mut bytes) {
            Ok(()) => u128::from_be_bytes(bytes),
            Err(e) => {
                tracing::debug!("getrandom failed ({e}), seeding from the clock");
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or(0x5eed)
            }
        }
    }

    pub fn rand_u64(&mut self) -> u64 {
        self.0.rand_u64()
    }

    /// Uniform in `[0, 1)`.
    pub fn rand_float(&mut self) -> f64 {
        self.0.rand_float()
    }

    pub fn rand_range(&mut self, range: core::ops::Range<u64>) -> u64 {
        self.0.rand_range(range)
    }

    /// Uniform float in `[lo, hi)`; returns `lo` for an empty range.
    pub fn rand_between(&mut self, lo: f64, hi: f64) -> f64 {
        if hi <= lo {
            return lo;
        }
        lo + (hi - lo) * self.rand_float()
    }

    /// Uniform integer in `[lo, hi)`; returns `lo` for an empty range.
    pub fn rand_int(&mut self, lo: i64, hi: i64) -> i64 {
        if hi <= lo {
            return lo;
        }
        let span = hi.abs_diff(lo);
        lo.wrapping_add(self.rand_range(0..span) as i64)
    }

    /// Random index into a collection of `len` items. `len` must be non-zero.
    pub fn rand_index(&mut self, len: usize) -> usize {
        self.rand_range(0..len as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reproducible_stream() {
        let mut r1 = Rng::new_with_seed(7);
        let mut r2 = Rng::new_with_seed(7);
        assert!((0..100).all(|_| r1.rand_u64() == r2.rand_u64()));

        let mut r3 = Rng::new_with_seed(8);
        let mut r4 = Rng::new_with_seed(9);
        assert!((0..100).any(|_| r3.rand_u64() != r4.rand_u64()));
    }

    #[test]
    fn test_ranges() {
        let mut rng = Rng::new_with_seed(42);
        for _ in 0..500 {
            let i = rng.rand_int(-3, 4);
            assert!((-3..4).contains(&i));
            let f = rng.rand_between(0.5, 1.5);
            assert!((0.5..1.5).contains(&f));
        }
        assert_eq!(rng.rand_int(5, 5), 5);
        assert_eq!(rng.rand_between(2.0, 1.0), 2.0);
    }
}
