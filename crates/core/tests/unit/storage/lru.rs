//! LRU list and nuking tests.

use objcache_core::storage::Stevedore;
use objcache_core::storage::lru::Lru;

use crate::common::{busy_object, finish_body, malloc_stv_capped, pattern, worker};

// ══════════════════════════════════════════════════════════
// 1. List membership
// ══════════════════════════════════════════════════════════

#[test]
fn finished_objects_enter_the_lru() {
    let mut wrk = worker();
    let stv = malloc_stv_capped("l0", 8 << 20);
    let lru = stv.lru().expect("malloc has an lru");
    assert!(lru.is_empty());

    let oc = busy_object(&mut wrk, &stv);
    finish_body(&mut wrk, &oc, b"body");
    oc.boc_done(&mut wrk);
    assert_eq!(stv.lru().expect("lru").len(), 1);
    assert!(!oc.last_lru().is_nan());

    oc.kill();
    oc.free_obj(&mut wrk);
    assert!(stv.lru().expect("lru").is_empty());
}

#[test]
fn touch_is_rate_limited() {
    let mut wrk = worker();
    let stv = malloc_stv_capped("l1", 8 << 20);
    let first = busy_object(&mut wrk, &stv);
    finish_body(&mut wrk, &first, b"a");
    first.boc_done(&mut wrk);
    let stamp = first.last_lru();

    // A touch within the interval is ignored.
    first.touch(&mut wrk, stamp + 0.5);
    assert_eq!(first.last_lru(), stamp);

    // A touch outside the interval re-stamps.
    first.touch(&mut wrk, stamp + 1000.0);
    assert_eq!(first.last_lru(), stamp + 1000.0);
}

#[test]
fn untracked_objects_are_not_touched() {
    let wrk = &mut worker();
    let lru = Lru::new();
    let oc = objcache_core::ObjCore::new(wrk);
    // Never added: last_lru stays NaN and touch is a no-op.
    assert!(oc.last_lru().is_nan());
    lru.touch(&oc, 123.0);
    assert!(oc.last_lru().is_nan());
}

// ══════════════════════════════════════════════════════════
// 2. Nuking under pressure
// ══════════════════════════════════════════════════════════

#[test]
fn allocation_pressure_nukes_the_coldest_object() {
    let mut wrk = worker();
    // Room for roughly two bodies.
    let stv = malloc_stv_capped("l2", 2 << 20);

    let a = busy_object(&mut wrk, &stv);
    finish_body(&mut wrk, &a, &pattern(900 * 1024, 1));
    a.boc_done(&mut wrk);

    let b = busy_object(&mut wrk, &stv);
    finish_body(&mut wrk, &b, &pattern(900 * 1024, 2));
    b.boc_done(&mut wrk);

    // Only the cache may hold nukable objects.
    drop(a);

    // The third object cannot fit without evicting; the cold `a` goes.
    let c = busy_object(&mut wrk, &stv);
    finish_body(&mut wrk, &c, &pattern(900 * 1024, 3));
    c.boc_done(&mut wrk);

    assert_eq!(wrk.stats.n_lru_nuked, 1);
    assert_eq!(stv.lru().expect("lru").len(), 2);
}

#[test]
fn busy_and_referenced_objects_are_not_nukable() {
    let mut wrk = worker();
    let stv = malloc_stv_capped("l3", 1 << 20);

    let a = busy_object(&mut wrk, &stv);
    finish_body(&mut wrk, &a, &pattern(700 * 1024, 1));
    a.boc_done(&mut wrk);
    // `a` stays referenced by this test, so it must not be nuked and
    // the next allocation must fail.
    let b = objcache_core::ObjCore::new(&mut wrk);
    let r = objcache_core::storage::new_object(&mut wrk, &stv, &b, 256);
    assert!(r.is_ok(), "header allocation itself fits");
    assert!(
        b.write_body(&mut wrk, &pattern(700 * 1024, 2), false).is_err(),
        "no room and nothing nukable"
    );
    assert_eq!(wrk.stats.n_lru_nuked, 0);
}
