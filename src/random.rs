//! Seeded uniform PRNG for instruction synthesis.
//!
//! The simulator never needs cryptographic randomness, but it does need
//! reproducibility: tests construct generators from fixed seeds and expect
//! identical instruction streams.

use std::time::{SystemTime, UNIX_EPOCH};

/// xorshift64* generator with a splitmix64-scrambled seed.
pub struct UniformRng {
    state: u64,
}

impl UniformRng {
    pub fn from_seed(seed: u64) -> UniformRng {
        // Scramble so that small seeds (0, 1, 2...) diverge immediately.
        // xorshift also requires a non-zero state.
        let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        UniformRng { state: z | 1 }
    }

    /// Seed from the system clock.
    pub fn from_entropy() -> UniformRng {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        UniformRng::from_seed(nanos)
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform value in `[lo, hi]` inclusive.
    pub fn gen_range(&mut self, lo: u64, hi: u64) -> u64 {
        debug_assert!(lo <= hi);
        let span = hi.wrapping_sub(lo).wrapping_add(1);
        if span == 0 {
            // lo == 0 && hi == u64::MAX; the whole domain.
            return self.next_u64();
        }
        lo + self.next_u64() % span
    }

    /// True with probability `1/denominator`.
    pub fn one_in(&mut self, denominator: u64) -> bool {
        self.gen_range(0, denominator - 1) == 0
    }

    /// Uniformly pick one element of a non-empty slice.
    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        &items[self.gen_range(0, items.len() as u64 - 1) as usize]
    }
}
