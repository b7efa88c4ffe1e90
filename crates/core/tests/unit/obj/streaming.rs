//! Streaming delivery, backpressure and cancellation.
//!
//! Exercises the fetcher/deliverer rendezvous: wait-extend pickup,
//! transit-buffer throttling, cancel release, and the byte-exactness of
//! delivered bodies while the fetch is still running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use objcache_core::common::error::DeliverError;
use objcache_core::obj::attr::{ObjAttr, oc_flags};
use objcache_core::obj::boc::BocState;
use objcache_core::stats::Worker;
use objcache_core::storage::Stevedore as _;

use crate::common::{busy_object, collect_body, malloc_stv, pattern, worker};

// ══════════════════════════════════════════════════════════
// 1. Wait-extend pickup (scenario: three chunks, one reader)
// ══════════════════════════════════════════════════════════

#[test]
fn wait_extend_observes_commits_in_order() {
    let mut wrk = worker();
    let stv = malloc_stv("st0");
    let oc = busy_object(&mut wrk, &stv);
    oc.set_state(&mut wrk, BocState::ReqDone);
    oc.set_state(&mut wrk, BocState::PrepStream);
    oc.set_state(&mut wrk, BocState::Stream);

    oc.write_body(&mut wrk, &pattern(100, 1), false).expect("room");
    let (rv, st) = oc.wait_extend(0);
    assert_eq!(rv, 100);
    assert!(st < BocState::Finished);

    oc.write_body(&mut wrk, &pattern(100, 2), false).expect("room");
    let (rv, _) = oc.wait_extend(100);
    assert_eq!(rv, 200);

    oc.write_body(&mut wrk, &pattern(50, 3), true).expect("room");
    oc.set_u64(&mut wrk, ObjAttr::Len, 250).expect("len");
    oc.set_state(&mut wrk, BocState::Finished);
    let (rv, st) = oc.wait_extend(200);
    assert_eq!(rv, 250);
    assert_eq!(st, BocState::Finished);
}

// ══════════════════════════════════════════════════════════
// 2. Transit-buffer backpressure
// ══════════════════════════════════════════════════════════

/// With a 50 byte transit buffer and 60 byte commits, each commit after
/// the first must wait until the deliverer has published enough
/// progress.
#[test]
fn transit_buffer_throttles_the_fetcher() {
    let mut wrk = worker();
    let stv = malloc_stv("st1");
    let oc = busy_object(&mut wrk, &stv);
    oc.set_flags(oc_flags::PRIVATE);
    oc.boc().expect("busy").set_transit_buffer(50);

    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let published = Arc::new(AtomicU64::new(0));

    let f_oc = Arc::clone(&oc);
    let f_log = Arc::clone(&log);
    let f_pub = Arc::clone(&published);
    let fetcher = std::thread::spawn(move || {
        let mut wrk = Worker::new();
        for i in 0..3u64 {
            f_oc.write_body(&mut wrk, &pattern(60, i as u8), false)
                .expect("room");
            // The commit we just completed must have been legal: at the
            // moment commit i ran, the deliverer had caught up to within
            // the transit buffer of the previous watermark.
            let seen = f_pub.load(Ordering::SeqCst);
            f_log
                .lock()
                .expect("log")
                .push(format!("commit{} delivered={}", i + 1, seen));
            if i > 0 {
                assert!(
                    60 * i <= seen + 50,
                    "commit {} ran before the deliverer caught up",
                    i + 1
                );
            }
        }
        f_oc.set_u64(&mut wrk, ObjAttr::Len, 180).expect("len");
        f_oc.set_state(&mut wrk, BocState::Finished);
    });

    let mut l = 0u64;
    loop {
        published.store(l, Ordering::SeqCst);
        let (rv, st) = oc.wait_extend(l);
        l = rv;
        if st == BocState::Finished && rv == 180 {
            break;
        }
        // Pretend to deliver slowly so the fetcher actually throttles.
        std::thread::sleep(Duration::from_millis(5));
    }
    fetcher.join().expect("fetcher");
    assert_eq!(l, 180);
}

// ══════════════════════════════════════════════════════════
// 3. Cancel unsticks a throttled fetcher
// ══════════════════════════════════════════════════════════

#[test]
fn cancel_releases_a_throttled_fetcher() {
    let mut wrk = worker();
    let stv = malloc_stv("st2");
    let oc = busy_object(&mut wrk, &stv);
    oc.set_flags(oc_flags::PRIVATE);
    oc.boc().expect("busy").set_transit_buffer(50);

    let f_oc = Arc::clone(&oc);
    let fetcher = std::thread::spawn(move || {
        let mut wrk = Worker::new();
        // First commit is free; the second blocks on the transit buffer
        // because the deliverer never advances.
        f_oc.write_body(&mut wrk, &pattern(60, 1), false).expect("room");
        f_oc.write_body(&mut wrk, &pattern(60, 2), false).expect("room");
        assert!(f_oc.has_flag(oc_flags::CANCEL));
        f_oc.set_state(&mut wrk, BocState::Failed);
    });

    std::thread::sleep(Duration::from_millis(100));
    oc.cancel();
    oc.wait_state(BocState::Failed);
    fetcher.join().expect("fetcher");
    assert_eq!(oc.boc().expect("busy").state(), BocState::Failed);
}

// ══════════════════════════════════════════════════════════
// 4. Byte-exact delivery
// ══════════════════════════════════════════════════════════

#[test]
fn finished_body_round_trips_byte_exact() {
    let mut wrk = worker();
    let stv = malloc_stv("st3");
    let oc = busy_object(&mut wrk, &stv);
    let mut body = Vec::new();
    for (len, seed) in [(100usize, 7u8), (64 * 1024, 8), (3, 9), (4096, 10)] {
        body.extend_from_slice(&pattern(len, seed));
    }
    crate::common::finish_body(&mut wrk, &oc, &body);
    oc.boc_done(&mut wrk);
    let got = collect_body(&mut wrk, &oc).expect("delivery");
    assert_eq!(got, body);
}

#[test]
fn concurrent_delivery_sees_exactly_the_committed_bytes() {
    let mut wrk = worker();
    let stv = malloc_stv("st4");
    let oc = busy_object(&mut wrk, &stv);
    oc.set_flags(oc_flags::TRANSIENT | oc_flags::PRIVATE);

    let body: Vec<u8> = pattern(256 * 1024, 42);
    let expect = body.clone();

    let f_oc = Arc::clone(&oc);
    let fetcher = std::thread::spawn(move || {
        let mut wrk = Worker::new();
        for chunk in body.chunks(10_000) {
            f_oc.write_body(&mut wrk, chunk, false).expect("room");
            std::thread::sleep(Duration::from_millis(1));
        }
        f_oc.extend(&mut wrk, 0, true);
        f_oc.set_u64(&mut wrk, ObjAttr::Len, body.len() as u64)
            .expect("len");
        f_oc.set_state(&mut wrk, BocState::Finished);
    });

    // Deliver while the fetch is still running; the iterator must see
    // the commit order with no gaps and no duplication, with "free
    // behind" reclaiming chunks as leases come back.
    let got = collect_body(&mut wrk, &oc).expect("delivery");
    fetcher.join().expect("fetcher");
    assert_eq!(got.len(), expect.len());
    assert_eq!(got, expect);
}

#[test]
fn failed_fetch_surfaces_as_delivery_error() {
    let mut wrk = worker();
    let stv = malloc_stv("st5");
    let oc = busy_object(&mut wrk, &stv);
    oc.write_body(&mut wrk, &pattern(60, 5), false).expect("room");
    oc.set_state(&mut wrk, BocState::Failed);

    let err = collect_body(&mut wrk, &oc).expect_err("failed fetch");
    assert_eq!(err, DeliverError::FetchFailed);
}

#[test]
fn consumer_abort_propagates() {
    let mut wrk = worker();
    let stv = malloc_stv("st6");
    let oc = busy_object(&mut wrk, &stv);
    crate::common::finish_body(&mut wrk, &oc, &pattern(100_000, 3));
    oc.boc_done(&mut wrk);

    let mut seen = 0usize;
    let r = oc.iterate(
        &mut wrk,
        &mut |_flags, data| {
            seen += data.len();
            if seen > 0 {
                Err(DeliverError::Aborted)
            } else {
                Ok(())
            }
        },
        true,
    );
    assert_eq!(r, Err(DeliverError::Aborted));
}

#[test]
fn scratch_buffers_are_leased_and_reclaimed() {
    use objcache_core::storage::vai::{
        BlockingNotify, VScarab, VScaret, VaiHandle as _, VaiNotify, Viov,
    };

    let mut wrk = worker();
    let stv = malloc_stv("st8");
    let oc = busy_object(&mut wrk, &stv);
    crate::common::finish_body(&mut wrk, &oc, b"filtered");
    oc.boc_done(&mut wrk);

    let sn = Arc::new(BlockingNotify::new());
    let mut hdl = stv
        .vai_init(&mut wrk, &oc, sn as Arc<dyn VaiNotify>)
        .expect("handle");

    // Ask storage for two scratch buffers of given sizes.
    let mut scarab = VScarab::new(4);
    for want in [100usize, 4096] {
        assert!(scarab.push(Viov {
            ptr: std::ptr::null(),
            len: want,
            lease: 0,
        }));
    }
    let n = hdl.buffer(&mut wrk, &mut scarab).expect("buffers");
    assert_eq!(n, 2);
    for vio in &scarab.s {
        assert!(!vio.ptr.is_null());
        assert!(vio.len >= 100);
        assert_ne!(vio.lease, 0);
    }

    // Returning the leases frees the buffers.
    let before = stv.stats().snapshot().2;
    let mut scaret = VScaret::new(4);
    for vio in &scarab.s {
        scaret.add(vio.lease);
    }
    hdl.return_leases(&mut wrk, &mut scaret);
    let after = stv.stats().snapshot().2;
    assert_eq!(before - after, 2, "both scratch buffers were released");
    hdl.finish(&mut wrk);
}

// ══════════════════════════════════════════════════════════
// 5. Invariants under concurrency
// ══════════════════════════════════════════════════════════

#[test]
fn delivered_never_exceeds_fetched() {
    let mut wrk = worker();
    let stv = malloc_stv("st7");
    let oc = busy_object(&mut wrk, &stv);
    oc.set_flags(oc_flags::HFM);
    oc.boc().expect("busy").set_transit_buffer(128);

    let f_oc = Arc::clone(&oc);
    let fetcher = std::thread::spawn(move || {
        let mut wrk = Worker::new();
        for i in 0..20u8 {
            f_oc.write_body(&mut wrk, &pattern(100, i), false).expect("room");
        }
        f_oc.set_u64(&mut wrk, ObjAttr::Len, 2000).expect("len");
        f_oc.set_state(&mut wrk, BocState::Finished);
    });

    let boc = oc.boc().expect("busy");
    let mut l = 0;
    loop {
        let (rv, st) = oc.wait_extend(l);
        assert!(rv >= l);
        assert!(rv <= boc.fetched_so_far());
        l = rv;
        if st == BocState::Finished && rv == 2000 {
            break;
        }
    }
    fetcher.join().expect("fetcher");
}
