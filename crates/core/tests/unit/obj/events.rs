//! Event bus tests.
//!
//! Publishing an event with mask M must invoke exactly the subscribers
//! whose registered mask intersects M, each exactly once, in
//! registration order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use objcache_core::obj::ObjCore;
use objcache_core::obj::event::{ObjEvents, oev};

use crate::common::worker;

fn counter_sub(bus: &ObjEvents, mask: u32) -> (u64, Arc<AtomicU32>) {
    let hits = Arc::new(AtomicU32::new(0));
    let h = Arc::clone(&hits);
    let handle = bus.subscribe(
        mask,
        Box::new(move |_wrk, _oc, _ev| {
            let _ = h.fetch_add(1, Ordering::SeqCst);
        }),
    );
    (handle, hits)
}

// ══════════════════════════════════════════════════════════
// 1. Mask intersection
// ══════════════════════════════════════════════════════════

#[test]
fn only_overlapping_subscribers_fire() {
    let mut wrk = worker();
    let bus = ObjEvents::new();
    let oc = ObjCore::new(&mut wrk);

    let (_h1, ban_hits) = counter_sub(&bus, oev::BANCHG);
    let (_h2, ttl_hits) = counter_sub(&bus, oev::TTLCHG);
    let (_h3, all_hits) = counter_sub(&bus, oev::MASK);

    bus.send(&mut wrk, &oc, oev::BANCHG);
    assert_eq!(ban_hits.load(Ordering::SeqCst), 1);
    assert_eq!(ttl_hits.load(Ordering::SeqCst), 0);
    assert_eq!(all_hits.load(Ordering::SeqCst), 1);

    bus.send(&mut wrk, &oc, oev::TTLCHG | oev::INSERT);
    assert_eq!(ban_hits.load(Ordering::SeqCst), 1);
    assert_eq!(ttl_hits.load(Ordering::SeqCst), 1);
    assert_eq!(all_hits.load(Ordering::SeqCst), 2);
}

#[test]
fn each_subscriber_fires_exactly_once_per_event() {
    let mut wrk = worker();
    let bus = ObjEvents::new();
    let oc = ObjCore::new(&mut wrk);
    // A subscriber whose mask covers both published bits still fires
    // once per publish.
    let (_h, hits) = counter_sub(&bus, oev::BANCHG | oev::TTLCHG);
    bus.send(&mut wrk, &oc, oev::BANCHG | oev::TTLCHG);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

// ══════════════════════════════════════════════════════════
// 2. Unsubscription
// ══════════════════════════════════════════════════════════

#[test]
fn unsubscribe_recomputes_the_union_mask() {
    let mut wrk = worker();
    let bus = ObjEvents::new();
    let oc = ObjCore::new(&mut wrk);

    let (h1, ban_hits) = counter_sub(&bus, oev::BANCHG);
    let (_h2, ttl_hits) = counter_sub(&bus, oev::TTLCHG);

    bus.unsubscribe(h1);
    bus.send(&mut wrk, &oc, oev::BANCHG);
    bus.send(&mut wrk, &oc, oev::TTLCHG);
    assert_eq!(ban_hits.load(Ordering::SeqCst), 0);
    assert_eq!(ttl_hits.load(Ordering::SeqCst), 1);
}

#[test]
#[should_panic(expected = "unknown event subscription")]
fn double_unsubscribe_is_a_bug() {
    let bus = ObjEvents::new();
    let (h, _hits) = counter_sub(&bus, oev::INSERT);
    bus.unsubscribe(h);
    bus.unsubscribe(h);
}

// ══════════════════════════════════════════════════════════
// 3. Publish argument checking
// ══════════════════════════════════════════════════════════

#[test]
#[should_panic]
fn publishing_without_a_known_bit_asserts() {
    let mut wrk = worker();
    let bus = ObjEvents::new();
    let oc = ObjCore::new(&mut wrk);
    bus.send(&mut wrk, &oc, 0);
}
