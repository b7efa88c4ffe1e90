//! Objcore lifecycle tests.
//!
//! Covers creation, the forward-only state machine and its
//! preconditions, BOC retirement and teardown accounting.

use objcache_core::obj::ObjCore;
use objcache_core::obj::attr::{ObjAttr, oc_flags};
use objcache_core::obj::boc::BocState;
use objcache_core::storage::Stevedore as _;

use crate::common::{busy_object, finish_body, malloc_stv, worker};

// ══════════════════════════════════════════════════════════
// 1. Creation
// ══════════════════════════════════════════════════════════

#[test]
fn new_object_is_busy_with_a_boc() {
    let mut wrk = worker();
    let oc = ObjCore::new(&mut wrk);
    assert!(oc.has_flag(oc_flags::BUSY));
    assert!(oc.boc().is_some());
    assert!(oc.last_lru().is_nan());
    assert_eq!(wrk.stats.n_objectcore, 1);
    ObjCore::destroy(&mut wrk, &oc);
    assert_eq!(wrk.stats.n_objectcore, 0);
}

#[test]
fn new_object_has_no_stevedore() {
    let mut wrk = worker();
    let oc = ObjCore::new(&mut wrk);
    assert!(oc.stevedore_opt().is_none());
}

// ══════════════════════════════════════════════════════════
// 2. State machine
// ══════════════════════════════════════════════════════════

#[test]
fn state_moves_forward() {
    let mut wrk = worker();
    let stv = malloc_stv("lc0");
    let oc = busy_object(&mut wrk, &stv);
    oc.set_state(&mut wrk, BocState::ReqDone);
    oc.set_state(&mut wrk, BocState::PrepStream);
    oc.set_state(&mut wrk, BocState::Stream);
    assert_eq!(oc.boc().expect("busy").state(), BocState::Stream);
}

#[test]
#[should_panic(expected = "forward")]
fn state_cannot_move_backward() {
    let mut wrk = worker();
    let stv = malloc_stv("lc1");
    let oc = busy_object(&mut wrk, &stv);
    oc.set_state(&mut wrk, BocState::PrepStream);
    oc.set_state(&mut wrk, BocState::ReqDone);
}

#[test]
#[should_panic(expected = "PREP_STREAM")]
fn stream_requires_prep_stream() {
    let mut wrk = worker();
    let stv = malloc_stv("lc2");
    let oc = busy_object(&mut wrk, &stv);
    oc.set_state(&mut wrk, BocState::ReqDone);
    oc.set_state(&mut wrk, BocState::Stream);
}

#[test]
#[should_panic(expected = "LEN")]
fn finished_requires_len_attribute() {
    let mut wrk = worker();
    let stv = malloc_stv("lc3");
    let oc = busy_object(&mut wrk, &stv);
    oc.set_state(&mut wrk, BocState::Finished);
}

#[test]
fn wait_state_returns_once_reached() {
    let mut wrk = worker();
    let stv = malloc_stv("lc4");
    let oc = busy_object(&mut wrk, &stv);
    oc.set_state(&mut wrk, BocState::ReqDone);
    oc.wait_state(BocState::ReqDone);
}

// ══════════════════════════════════════════════════════════
// 3. BOC retirement and teardown
// ══════════════════════════════════════════════════════════

#[test]
fn boc_done_retires_the_boc() {
    let mut wrk = worker();
    let stv = malloc_stv("lc5");
    let oc = busy_object(&mut wrk, &stv);
    finish_body(&mut wrk, &oc, b"retire me");
    oc.boc_done(&mut wrk);
    assert!(oc.boc().is_none());
    assert!(!oc.has_flag(oc_flags::BUSY));
    // Attribute reads now go straight to storage.
    assert_eq!(oc.get_len(&mut wrk), 9);
}

#[test]
fn free_obj_disassociates_the_stevedore() {
    let mut wrk = worker();
    let stv = malloc_stv("lc6");
    let oc = busy_object(&mut wrk, &stv);
    finish_body(&mut wrk, &oc, b"x");
    oc.boc_done(&mut wrk);
    assert_eq!(wrk.stats.n_object, 1);
    oc.kill();
    oc.free_obj(&mut wrk);
    assert!(oc.stevedore_opt().is_none());
    assert_eq!(wrk.stats.n_object, 0);
}

#[test]
fn free_with_live_boc_releases_everything() {
    // Object replaced mid-fetch (backend error): objfree with the boc
    // still attached.
    let mut wrk = worker();
    let stv = malloc_stv("lc7");
    let oc = busy_object(&mut wrk, &stv);
    oc.write_body(&mut wrk, b"partial", false).expect("room");
    oc.free_obj(&mut wrk);
    assert!(oc.stevedore_opt().is_none());
    let (_, _, g_alloc, g_bytes) = stv.stats().snapshot();
    assert_eq!(g_alloc, 0);
    assert_eq!(g_bytes, 0);
}

// ══════════════════════════════════════════════════════════
// 4. Snipe / kill
// ══════════════════════════════════════════════════════════

#[test]
fn snipe_only_kills_idle_objects() {
    let mut wrk = worker();
    let stv = malloc_stv("lc8");
    let oc = busy_object(&mut wrk, &stv);
    let extra = std::sync::Arc::clone(&oc);
    assert!(!oc.snipe(1), "a second handle must block the snipe");
    drop(extra);
    assert!(oc.snipe(1));
    assert!(oc.has_flag(oc_flags::DYING));
}

#[test]
fn slim_keeps_attributes() {
    let mut wrk = worker();
    let stv = malloc_stv("lc9");
    let oc = busy_object(&mut wrk, &stv);
    finish_body(&mut wrk, &oc, &[0xa5; 4000]);
    oc.set_attr(&mut wrk, ObjAttr::Vary, b"Accept-Encoding")
        .expect("vary fits");
    oc.boc_done(&mut wrk);

    oc.slim(&mut wrk);
    assert_eq!(
        oc.get_attr(&mut wrk, ObjAttr::Vary).as_deref(),
        Some(&b"Accept-Encoding"[..])
    );
    assert_eq!(oc.get_len(&mut wrk), 4000);
}
