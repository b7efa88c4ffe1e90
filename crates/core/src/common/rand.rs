//! Pseudo-random number generation.
//!
//! Selection policies (the random director) and silo identity need cheap,
//! unsynchronized randomness, not cryptographic strength. A xorshift64
//! generator is used, seeded once from the operating system.

use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

/// A xorshift64 pseudo-random generator.
#[derive(Debug, Clone)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    /// Creates a generator from an explicit non-zero seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9e37_79b9_7f4a_7c15 } else { seed },
        }
    }

    /// Creates a generator seeded from the operating system.
    ///
    /// Reads `/dev/urandom`; falls back to the wall clock if that fails
    /// (containers without a device tree).
    pub fn seeded() -> Self {
        let seed = fs::read("/dev/urandom")
            .ok()
            .filter(|b| b.len() >= 8)
            .map(|b| {
                let mut s = [0u8; 8];
                s.copy_from_slice(&b[..8]);
                u64::from_ne_bytes(s)
            })
            .unwrap_or_else(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0x5851_f42d_4c95_7f2d)
            });
        Self::from_seed(seed)
    }

    /// Returns the next pseudo-random `u64`.
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Returns a uniform variate in `[0, 1)`.
    pub fn next_unit(&mut self) -> f64 {
        // 53 significant bits, the full precision of an f64 mantissa.
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}
