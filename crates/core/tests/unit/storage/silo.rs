//! Persistent silo tests.
//!
//! Round trips a silo through create / populate / close / reopen,
//! exercises torn-write recovery of the double-buffered metadata, lazy
//! resurrection with fix-up, expiry filtering at load, and the ban
//! journal.

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use objcache_core::obj::attr::ObjAttr;
use objcache_core::obj::boc::BocState;
use objcache_core::obj::{Expiry, ObjCore};
use objcache_core::storage::persistent::SiloStevedore;
use objcache_core::storage::{BanInfo, Stevedore, new_object};

use crate::common::{collect_body, pattern, worker};

const SILO_SIZE: u64 = 16 << 20;

fn open_silo(name: &str, path: &Path) -> Arc<SiloStevedore> {
    let stv = SiloStevedore::create(name, path, SILO_SIZE).expect("silo open");
    while !stv.silo().is_loaded() {
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    stv
}

fn close_silo(stv: &Arc<SiloStevedore>) {
    Stevedore::close(&**stv, true);
    Stevedore::close(&**stv, false);
}

/// Creates one finished cached object with the given digest and body.
fn put_object(
    wrk: &mut objcache_core::Worker,
    stv: &Arc<SiloStevedore>,
    digest: [u8; 32],
    body: &[u8],
    ttl: f64,
) -> Arc<ObjCore> {
    let dyn_stv: Arc<dyn Stevedore> = Arc::clone(stv) as Arc<dyn Stevedore>;
    let oc = ObjCore::new(wrk);
    oc.set_digest(digest);
    oc.set_exp(Expiry {
        t_origin: objcache_core::common::time::real(),
        ttl,
        grace: 0.0,
        keep: 0.0,
    });
    new_object(wrk, &dyn_stv, &oc, 256).expect("silo allocobj");
    oc.write_body(wrk, body, true).expect("body fits");
    oc.set_u64(wrk, ObjAttr::Len, body.len() as u64).expect("len");
    oc.set_state(wrk, BocState::Finished);
    oc.boc_done(wrk);
    oc
}

fn corrupt(path: &Path, offset: u64) {
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .expect("open silo file");
    f.seek(SeekFrom::Start(offset)).expect("seek");
    f.write_all(&[0u8; 128]).expect("zero the slot head");
    f.sync_all().expect("sync");
}

// ══════════════════════════════════════════════════════════
// 1. Create / populate / reopen round trip
// ══════════════════════════════════════════════════════════

#[test]
fn objects_survive_a_reopen() {
    let mut wrk = worker();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("silo.bin");
    let body = pattern(10_000, 21);

    let stv = open_silo("p0", &path);
    let oc = put_object(&mut wrk, &stv, [7; 32], &body, 3600.0);
    drop(oc);
    close_silo(&stv);
    drop(stv);

    let stv = open_silo("p1", &path);
    let res = stv.silo().resurrected();
    assert_eq!(res.len(), 1, "one object resurrected");
    let oc = Arc::clone(&res[0]);
    assert_eq!(oc.digest(), Some([7; 32]));
    assert!(oc.exp().when() > objcache_core::common::time::real());

    // First body access runs the fix-up and must yield the exact bytes.
    let got = collect_body(&mut wrk, &oc).expect("delivery");
    assert_eq!(got, body);
    assert_eq!(oc.get_len(&mut wrk), body.len() as u64);

    drop(oc);
    drop(res);
    close_silo(&stv);
}

#[test]
fn expired_objects_are_not_resurrected() {
    let mut wrk = worker();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("silo.bin");

    let stv = open_silo("p2", &path);
    // Expiry lies in the past by construction.
    let oc = ObjCore::new(&mut wrk);
    oc.set_exp(Expiry {
        t_origin: objcache_core::common::time::real() - 100.0,
        ttl: 1.0,
        grace: 0.0,
        keep: 0.0,
    });
    let dyn_stv: Arc<dyn Stevedore> = Arc::clone(&stv) as Arc<dyn Stevedore>;
    new_object(&mut wrk, &dyn_stv, &oc, 256).expect("allocobj");
    oc.write_body(&mut wrk, b"stale", true).expect("body");
    oc.set_u64(&mut wrk, ObjAttr::Len, 5).expect("len");
    oc.set_state(&mut wrk, BocState::Finished);
    oc.boc_done(&mut wrk);
    drop(oc);
    close_silo(&stv);
    drop(stv);

    let stv = open_silo("p3", &path);
    assert!(stv.silo().resurrected().is_empty());
    close_silo(&stv);
}

// ══════════════════════════════════════════════════════════
// 2. Torn-write recovery (scenario S5)
// ══════════════════════════════════════════════════════════

#[test]
fn a_torn_segment_table_slot_is_repaired_from_the_other() {
    let mut wrk = worker();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("silo.bin");
    let body = pattern(5000, 5);

    let stv = open_silo("p4", &path);
    let offsets = stv.silo().layout_offsets();
    let oc = put_object(&mut wrk, &stv, [9; 32], &body, 3600.0);
    drop(oc);
    close_silo(&stv);
    drop(stv);

    // Crash mid-write of slot 2: its signature never hit the disk.
    corrupt(&path, offsets[3]);
    let stv = open_silo("p5", &path);
    assert_eq!(stv.silo().resurrected().len(), 1, "slot 1 carried the day");
    let oc = Arc::clone(&stv.silo().resurrected()[0]);
    assert_eq!(collect_body(&mut wrk, &oc).expect("delivery"), body);
    drop(oc);
    close_silo(&stv);
    drop(stv);

    // Slot 2 must have been repaired on that open: now break slot 1.
    corrupt(&path, offsets[2]);
    let stv = open_silo("p6", &path);
    assert_eq!(
        stv.silo().resurrected().len(),
        1,
        "repaired slot 2 carries the day"
    );
    close_silo(&stv);
}

#[test]
fn both_slots_torn_means_no_reload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("silo.bin");

    let stv = open_silo("p7", &path);
    let offsets = stv.silo().layout_offsets();
    close_silo(&stv);
    drop(stv);

    corrupt(&path, offsets[2]);
    corrupt(&path, offsets[3]);
    let r = SiloStevedore::create("p8", &path, SILO_SIZE);
    assert!(r.is_err(), "both segment table slots corrupt");
}

// ══════════════════════════════════════════════════════════
// 3. Ban journal
// ══════════════════════════════════════════════════════════

#[test]
fn ban_journal_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("silo.bin");

    let stv = open_silo("p9", &path);
    stv.baninfo(BanInfo::New, b"req.url ~ ^/old").expect("append");
    stv.baninfo(BanInfo::New, b"req.url ~ ^/older").expect("append");
    close_silo(&stv);
    drop(stv);

    let stv = open_silo("pa", &path);
    let bans = stv.silo().ban_bytes();
    assert_eq!(&bans, b"req.url ~ ^/oldreq.url ~ ^/older");

    // Bulk export replaces the journal wholesale.
    stv.banexport(b"compacted");
    assert_eq!(stv.silo().ban_bytes(), b"compacted");
    close_silo(&stv);
}

// ══════════════════════════════════════════════════════════
// 4. Maintenance surface
// ══════════════════════════════════════════════════════════

#[test]
fn report_and_sync_describe_segments() {
    let mut wrk = worker();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("silo.bin");

    let stv = open_silo("pb", &path);
    let oc = put_object(&mut wrk, &stv, [1; 32], b"tiny", 3600.0);
    let report = stv.silo().report();
    assert!(report.contains("Seg:"), "report lists segments: {report}");
    assert!(report.contains("1 nobj"), "live object counted: {report}");

    // Sync closes the current segment and opens a fresh one.
    stv.silo().sync_current();
    let report = stv.silo().report();
    assert!(report.contains("Alloc:"), "a current segment is open again");
    drop(oc);
    close_silo(&stv);
}

// ══════════════════════════════════════════════════════════
// 5. Object event reaction
// ══════════════════════════════════════════════════════════

/// TTL changes published on the event bus are written through to the
/// object's on-disk record, so the new expiry survives a reopen.
#[test]
fn ttl_change_events_update_the_disk_record() {
    use objcache_core::obj::event::{ObjEvents, oev};

    let mut wrk = worker();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("silo.bin");

    let stv = open_silo("pe", &path);
    let oc = put_object(&mut wrk, &stv, [3; 32], b"retimed", 60.0);

    // The expiry moves far into the future; the silo hears about it on
    // the bus and updates the record in place.
    let far = objcache_core::common::time::real() + 50_000.0;
    oc.set_exp(objcache_core::obj::Expiry {
        t_origin: far,
        ttl: 0.0,
        grace: 0.0,
        keep: 0.0,
    });
    ObjEvents::global().send(&mut wrk, &oc, oev::TTLCHG);

    drop(oc);
    close_silo(&stv);
    drop(stv);

    let stv = open_silo("pf", &path);
    let res = stv.silo().resurrected();
    assert_eq!(res.len(), 1);
    assert!(
        res[0].exp().when() > far - 1.0,
        "updated expiry came back from disk"
    );
    drop(res);
    close_silo(&stv);
}

#[test]
fn freeing_an_object_clears_its_record() {
    let mut wrk = worker();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("silo.bin");

    let stv = open_silo("pc", &path);
    let oc = put_object(&mut wrk, &stv, [2; 32], b"doomed", 3600.0);
    oc.kill();
    oc.free_obj(&mut wrk);
    drop(oc);
    close_silo(&stv);
    drop(stv);

    let stv = open_silo("pd", &path);
    assert!(stv.silo().resurrected().is_empty(), "freed object is gone");
    close_silo(&stv);
}
