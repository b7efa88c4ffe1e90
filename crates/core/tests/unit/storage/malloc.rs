//! Malloc stevedore tests.

use proptest::prelude::*;

use objcache_core::storage::Stevedore;
use objcache_core::storage::malloc::MallocStevedore;

use crate::common::{busy_object, finish_body, malloc_stv_capped, worker};

// ══════════════════════════════════════════════════════════
// 1. The byte cap
// ══════════════════════════════════════════════════════════

#[test]
fn cap_is_enforced() {
    let stv = MallocStevedore::with_cap("m0", 1 << 20);
    let a = stv.sml_alloc(512 * 1024).expect("first fits");
    let b = stv.sml_alloc(512 * 1024).expect("second fits");
    assert!(stv.sml_alloc(1).is_err(), "cap reached");
    assert_eq!(
        stv.stats().c_fail.load(std::sync::atomic::Ordering::Relaxed),
        1
    );
    stv.sml_free(a);
    let _ = stv.sml_alloc(1024).expect("space again after a free");
    stv.sml_free(b);
}

#[test]
fn unlimited_store_reports_no_space_shrinkage() {
    let stv = MallocStevedore::with_cap("m1", u64::MAX);
    let a = stv.sml_alloc(4096).expect("alloc");
    assert_eq!(
        stv.stats().g_space.load(std::sync::atomic::Ordering::Relaxed),
        0
    );
    stv.sml_free(a);
}

// ══════════════════════════════════════════════════════════
// 2. Counter invariants
// ══════════════════════════════════════════════════════════

proptest! {
    /// c_bytes − c_freed == g_bytes and g_alloc matches the number of
    /// outstanding allocations, at every step of any alloc/free
    /// sequence.
    #[test]
    fn counters_balance(ops in proptest::collection::vec(1usize..64 * 1024, 1..40)) {
        let stv = MallocStevedore::with_cap("mp", u64::MAX);
        let mut live = Vec::new();
        for (i, sz) in ops.iter().enumerate() {
            if i % 3 == 2 && !live.is_empty() {
                stv.sml_free(live.swap_remove(i % live.len()));
            } else {
                live.push(stv.sml_alloc(*sz).expect("unlimited"));
            }
            let (c_bytes, c_freed, g_alloc, g_bytes) = stv.stats().snapshot();
            prop_assert_eq!(c_bytes - c_freed, g_bytes);
            prop_assert_eq!(g_alloc as usize, live.len());
        }
        for st in live.drain(..) {
            stv.sml_free(st);
        }
        let (c_bytes, c_freed, g_alloc, g_bytes) = stv.stats().snapshot();
        prop_assert_eq!(c_bytes, c_freed);
        prop_assert_eq!(g_alloc, 0);
        prop_assert_eq!(g_bytes, 0);
    }
}

// ══════════════════════════════════════════════════════════
// 3. Objects end to end
// ══════════════════════════════════════════════════════════

#[test]
fn object_lifecycle_balances_counters() {
    let mut wrk = worker();
    let stv = malloc_stv_capped("m2", 8 << 20);
    let oc = busy_object(&mut wrk, &stv);
    finish_body(&mut wrk, &oc, &crate::common::pattern(100_000, 1));
    oc.boc_done(&mut wrk);
    oc.kill();
    oc.free_obj(&mut wrk);
    let (c_bytes, c_freed, g_alloc, g_bytes) = stv.stats().snapshot();
    assert_eq!(c_bytes, c_freed);
    assert_eq!(g_alloc, 0);
    assert_eq!(g_bytes, 0);
}
