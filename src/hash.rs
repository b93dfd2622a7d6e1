//! Hashing primitives shared by the encoders and sketches.
//!
//! Nothing here holds global state: everything that needs randomness derives
//! it from a [`HashContext`] that is created once per run and passed along.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

/// Unseeded 64-bit hash of `x`: xxh3 of its little-endian bytes.
///
/// Sketches mix every incoming value with this, so raw packed k-mers and
/// already-hashed values are both valid inputs.
#[inline(always)]
pub fn mix64(x: u64) -> u64 {
    xxh3_64(&x.to_le_bytes())
}

/// Explicit source of seeded hashing for one run.
///
/// Components that need random tables or seeded scores take a reference to
/// this instead of consulting process-wide state.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HashContext {
    seed: u64,
}

impl HashContext {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Independent seed for the `stream`-th consumer of this context.
    pub fn derive(&self, stream: u64) -> u64 {
        xxh3_64_with_seed(&stream.to_le_bytes(), self.seed)
    }

    /// Seeded 64-bit hash of `x`.
    #[inline(always)]
    pub fn hash(&self, x: u64) -> u64 {
        xxh3_64_with_seed(&x.to_le_bytes(), self.seed)
    }

    /// Widen a 32-bit hash (as produced by ntHash) to 64 bits.
    #[inline(always)]
    pub fn widen(&self, h: u32) -> u64 {
        xxh3_64_with_seed(&h.to_le_bytes(), self.seed)
    }

    /// Table of 256 pseudo-random words for the rolling hashers.
    pub fn table(&self, stream: u64) -> [u64; 256] {
        let mut rng = ChaCha8Rng::seed_from_u64(self.derive(stream));
        std::array::from_fn(|_| rng.random())
    }

    /// Odd multiplier for Rabin-Karp hashing.
    pub fn odd_base(&self, stream: u64) -> u64 {
        self.derive(stream) | 1
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mix_is_injective_on_small_range() {
        let mut seen = std::collections::HashSet::new();
        for x in 0..100_000u64 {
            assert!(seen.insert(mix64(x)));
        }
    }

    #[test]
    fn derived_seeds_differ() {
        let ctx = HashContext::new(42);
        assert_ne!(ctx.derive(0), ctx.derive(1));
        assert_ne!(ctx.derive(0), HashContext::new(43).derive(0));
        assert_eq!(ctx.table(3), ctx.table(3));
        assert_ne!(ctx.table(3), ctx.table(4));
        assert_eq!(ctx.odd_base(7) & 1, 1);
    }

    #[test]
    fn seed_changes_hashes() {
        let (a, b) = (HashContext::new(1), HashContext::new(2));
        let x = rand::random::<u64>();
        assert_ne!(a.hash(x), b.hash(x));
        assert_ne!(a.widen(x as u32), b.widen(x as u32));
        assert_eq!(a.hash(x), HashContext::new(1).hash(x));
    }
}
