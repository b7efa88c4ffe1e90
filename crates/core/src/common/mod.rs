//! Common types and helpers shared across the cache core.
//!
//! This module provides the low-level infrastructure every other component
//! rests on:
//! 1. **Errors:** Typed error enums for allocation, iteration, silo and
//!    backend failures.
//! 2. **Encoding:** Big-endian attribute encoding, including the
//!    endian-agnostic double representation.
//! 3. **Randomness:** A small xorshift PRNG for selection policies and
//!    silo identity.
//! 4. **Time:** Wall-clock seconds as `f64` plus sleep helpers.

/// Big-endian encode/decode helpers for object attributes.
pub mod encode;
/// Typed error enums for the cache core subsystems.
pub mod error;
/// Pseudo-random number generation (xorshift64).
pub mod rand;
/// Wall-clock and sleep helpers, seconds as `f64`.
pub mod time;
