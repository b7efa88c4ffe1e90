//! Stevedore tests.

/// LRU touch discipline and nuking.
pub mod lru;
/// Malloc stevedore: caps and counters.
pub mod malloc;
/// Persistent silo: formats, recovery, resurrection.
pub mod silo;
/// Umem stevedore: slab classes.
pub mod umem;
