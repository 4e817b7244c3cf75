// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Random number generation trait
//!
//! The stack never owns an entropy source; the host injects one. Hardware
//! targets wire this to the radio/SoC TRNG, tests use a deterministic
//! xorshift generator.

use crate::error::CryptoError;

/// Cryptographically secure random number source
pub trait CryptoRng {
    /// Fill `dest` with random bytes
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::RngFailure` if the underlying source fails.
    fn fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), CryptoError>;

    /// Uniform-ish random integer in `[min, max)`
    ///
    /// Modulo bias is acceptable for the jitter/backoff draws this is used
    /// for; key material always goes through `fill_bytes`.
    fn next_in_range(&mut self, min: u32, max: u32) -> u32 {
        debug_assert!(min < max);
        let mut buf = [0u8; 4];
        if self.fill_bytes(&mut buf).is_err() {
            return min;
        }
        let num = u32::from_le_bytes(buf);
        (num % (max - min)) + min
    }
}

/// Deterministic xorshift generator for tests and simulations.
///
/// NOT cryptographically secure; never use on a real node.
pub struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    /// Create a new generator from a non-zero seed
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

impl CryptoRng for XorShiftRng {
    fn fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), CryptoError> {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_bounds() {
        let mut rng = XorShiftRng::new(42);
        for _ in 0..1000 {
            let v = rng.next_in_range(1, 4);
            assert!((1..4).contains(&v));
        }
    }

    #[test]
    fn test_deterministic() {
        let mut a = XorShiftRng::new(7);
        let mut b = XorShiftRng::new(7);
        let mut ba = [0u8; 16];
        let mut bb = [0u8; 16];
        a.fill_bytes(&mut ba).unwrap();
        b.fill_bytes(&mut bb).unwrap();
        assert_eq!(ba, bb);
    }
}
