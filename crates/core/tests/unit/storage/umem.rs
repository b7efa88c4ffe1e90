//! Umem stevedore tests.

use objcache_core::storage::Stevedore;
use objcache_core::storage::umem::UmemStevedore;

// ══════════════════════════════════════════════════════════
// 1. Slab classes
// ══════════════════════════════════════════════════════════

#[test]
fn allocations_round_to_slab_classes() {
    let stv = UmemStevedore::with_cap("u0", u64::MAX);
    let small = stv.sml_alloc(100).expect("alloc");
    assert_eq!(small.space(), 4096, "minimum class");
    let mid = stv.sml_alloc(5000).expect("alloc");
    assert_eq!(mid.space(), 8192, "next power of two");
    let exact = stv.sml_alloc(16384).expect("alloc");
    assert_eq!(exact.space(), 16384, "exact class");
    stv.sml_free(small);
    stv.sml_free(mid);
    stv.sml_free(exact);
}

#[test]
fn oversized_requests_bypass_the_classes() {
    let stv = UmemStevedore::with_cap("u1", u64::MAX);
    let big = stv.sml_alloc(3 << 20).expect("alloc");
    assert_eq!(big.space(), 3 << 20);
    stv.sml_free(big);
}

#[test]
fn freed_chunks_are_reused_from_the_class_cache() {
    let stv = UmemStevedore::with_cap("u2", u64::MAX);
    let a = stv.sml_alloc(4096).expect("alloc");
    let ptr = a.as_ptr();
    stv.sml_free(a);
    let b = stv.sml_alloc(4000).expect("alloc");
    assert_eq!(b.as_ptr(), ptr, "same class reuses the cached chunk");
    assert_eq!(b.len(), 0, "reused chunk is reset");
    stv.sml_free(b);
}

// ══════════════════════════════════════════════════════════
// 2. Cap and counters
// ══════════════════════════════════════════════════════════

#[test]
fn cap_counts_class_sizes() {
    let stv = UmemStevedore::with_cap("u3", 8192);
    // A 5000 byte request costs a full 8 KiB class.
    let a = stv.sml_alloc(5000).expect("alloc");
    assert!(stv.sml_alloc(100).is_err(), "class accounting fills the cap");
    stv.sml_free(a);
    let b = stv.sml_alloc(100).expect("fits again");
    stv.sml_free(b);
}

#[test]
fn counters_balance_through_the_cache() {
    let stv = UmemStevedore::with_cap("u4", u64::MAX);
    let a = stv.sml_alloc(4096).expect("alloc");
    stv.sml_free(a);
    let b = stv.sml_alloc(4096).expect("alloc");
    stv.sml_free(b);
    let (c_bytes, c_freed, g_alloc, g_bytes) = stv.stats().snapshot();
    assert_eq!(c_bytes, c_freed);
    assert_eq!(g_alloc, 0);
    assert_eq!(g_bytes, 0);
}
