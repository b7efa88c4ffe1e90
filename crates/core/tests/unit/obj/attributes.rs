//! Attribute model tests.
//!
//! Fixed attributes overwrite in place, variable attributes are
//! write-once with a strict length re-check, auxiliary attributes own
//! their storage, and numerics travel big-endian.

use objcache_core::obj::attr::{ObjAttr, obj_flags};
use objcache_core::storage::Stevedore as _;

use crate::common::{busy_object, malloc_stv, worker};

// ══════════════════════════════════════════════════════════
// 1. Fixed attributes
// ══════════════════════════════════════════════════════════

#[test]
fn fixed_attributes_overwrite_in_place() {
    let mut wrk = worker();
    let stv = malloc_stv("at0");
    let oc = busy_object(&mut wrk, &stv);
    oc.set_u64(&mut wrk, ObjAttr::Len, 1234).expect("set");
    assert_eq!(oc.get_u64(&mut wrk, ObjAttr::Len), Some(1234));
    oc.set_u64(&mut wrk, ObjAttr::Len, 99).expect("overwrite");
    assert_eq!(oc.get_len(&mut wrk), 99);
}

#[test]
fn numeric_attributes_are_big_endian() {
    let mut wrk = worker();
    let stv = malloc_stv("at1");
    let oc = busy_object(&mut wrk, &stv);
    oc.set_u64(&mut wrk, ObjAttr::Len, 0x0102_0304).expect("set");
    let raw = oc.get_attr(&mut wrk, ObjAttr::Len).expect("raw");
    assert_eq!(raw, vec![0, 0, 0, 0, 1, 2, 3, 4]);
}

#[test]
fn doubles_round_trip_via_u64_punning() {
    let mut wrk = worker();
    let stv = malloc_stv("at2");
    let oc = busy_object(&mut wrk, &stv);
    let t = 1_700_000_000.125f64;
    oc.set_double(&mut wrk, ObjAttr::LastModified, t).expect("set");
    assert_eq!(oc.get_double(&mut wrk, ObjAttr::LastModified), Some(t));
}

#[test]
#[should_panic(expected = "size mismatch")]
fn fixed_attribute_size_is_checked() {
    let mut wrk = worker();
    let stv = malloc_stv("at3");
    let oc = busy_object(&mut wrk, &stv);
    let _ = oc.set_attr(&mut wrk, ObjAttr::Len, &[1, 2, 3]);
}

// ══════════════════════════════════════════════════════════
// 2. Variable attributes
// ══════════════════════════════════════════════════════════

#[test]
fn variable_attributes_set_once() {
    let mut wrk = worker();
    let stv = malloc_stv("at4");
    let oc = busy_object(&mut wrk, &stv);
    oc.set_attr(&mut wrk, ObjAttr::Vary, b"Accept").expect("set");
    oc.set_attr(&mut wrk, ObjAttr::Headers, b"X-A: 1\r\n").expect("set");
    assert_eq!(
        oc.get_attr(&mut wrk, ObjAttr::Vary).as_deref(),
        Some(&b"Accept"[..])
    );
    assert_eq!(
        oc.get_attr(&mut wrk, ObjAttr::Headers).as_deref(),
        Some(&b"X-A: 1\r\n"[..])
    );
}

#[test]
fn variable_reset_with_equal_length_is_allowed() {
    let mut wrk = worker();
    let stv = malloc_stv("at5");
    let oc = busy_object(&mut wrk, &stv);
    oc.set_attr(&mut wrk, ObjAttr::Vary, b"abcdef").expect("set");
    oc.set_attr(&mut wrk, ObjAttr::Vary, b"ABCDEF").expect("re-set");
    assert_eq!(
        oc.get_attr(&mut wrk, ObjAttr::Vary).as_deref(),
        Some(&b"ABCDEF"[..])
    );
}

#[test]
#[should_panic(expected = "different length")]
fn variable_reset_with_other_length_panics() {
    let mut wrk = worker();
    let stv = malloc_stv("at6");
    let oc = busy_object(&mut wrk, &stv);
    oc.set_attr(&mut wrk, ObjAttr::Vary, b"abcdef").expect("set");
    let _ = oc.set_attr(&mut wrk, ObjAttr::Vary, b"xy");
}

#[test]
#[should_panic(expected = "reserve")]
fn variable_attribute_cannot_exceed_the_reserve() {
    let mut wrk = worker();
    let stv = malloc_stv("at7");
    let oc = busy_object(&mut wrk, &stv);
    // The fixture reserves 256 bytes of variable space.
    let _ = oc.set_attr(&mut wrk, ObjAttr::Headers, &[b'h'; 100_000]);
}

// ══════════════════════════════════════════════════════════
// 3. Auxiliary attributes
// ══════════════════════════════════════════════════════════

#[test]
fn aux_attribute_owns_its_allocation() {
    let mut wrk = worker();
    let stv = malloc_stv("at8");
    let oc = busy_object(&mut wrk, &stv);
    let esi = crate::common::pattern(10_000, 77);
    oc.set_attr(&mut wrk, ObjAttr::EsiData, &esi).expect("aux set");
    assert_eq!(oc.get_attr(&mut wrk, ObjAttr::EsiData), Some(esi));
    let (_, _, g_alloc, _) = stv.stats().snapshot();
    // Header chunk plus the aux allocation.
    assert_eq!(g_alloc, 2);
}

// ══════════════════════════════════════════════════════════
// 4. Presence and flags
// ══════════════════════════════════════════════════════════

#[test]
fn has_attr_tracks_the_present_mask() {
    let mut wrk = worker();
    let stv = malloc_stv("at9");
    let oc = busy_object(&mut wrk, &stv);
    assert_eq!(oc.oa_present(), 0);
    oc.set_u64(&mut wrk, ObjAttr::Len, 1).expect("set");
    assert!(oc.has_attr(&mut wrk, ObjAttr::Len));
    assert!(!oc.has_attr(&mut wrk, ObjAttr::Vary));
    assert_ne!(oc.oa_present() & ObjAttr::Len.present_bit(), 0);
}

#[test]
fn object_flags_live_in_the_flags_byte() {
    let mut wrk = worker();
    let stv = malloc_stv("ata");
    let oc = busy_object(&mut wrk, &stv);
    oc.set_obj_flag(&mut wrk, obj_flags::GZIPED, true).expect("set");
    oc.set_obj_flag(&mut wrk, obj_flags::ESIPROC, true).expect("set");
    assert!(oc.check_obj_flag(&mut wrk, obj_flags::GZIPED));
    assert!(!oc.check_obj_flag(&mut wrk, obj_flags::IMSCAND));
    oc.set_obj_flag(&mut wrk, obj_flags::GZIPED, false).expect("clear");
    assert!(!oc.check_obj_flag(&mut wrk, obj_flags::GZIPED));
    assert!(oc.check_obj_flag(&mut wrk, obj_flags::ESIPROC));
}

#[test]
fn copy_attr_moves_one_attribute_across_objects() {
    let mut wrk = worker();
    let stv = malloc_stv("atb");
    let src = busy_object(&mut wrk, &stv);
    let dst = busy_object(&mut wrk, &stv);
    src.set_attr(&mut wrk, ObjAttr::Vary, b"User-Agent").expect("set");
    dst.copy_attr_from(&mut wrk, &src, ObjAttr::Vary).expect("copy");
    assert_eq!(
        dst.get_attr(&mut wrk, ObjAttr::Vary).as_deref(),
        Some(&b"User-Agent"[..])
    );
    // Copying an absent attribute fails.
    assert!(dst.copy_attr_from(&mut wrk, &src, ObjAttr::Headers).is_err());
}

#[test]
fn vxid_is_a_four_byte_big_endian_attribute() {
    let mut wrk = worker();
    let stv = malloc_stv("atc");
    let oc = busy_object(&mut wrk, &stv);
    oc.set_xid(&mut wrk, 0xfeed_1234).expect("xid");
    assert_eq!(oc.get_xid(&mut wrk), Some(0xfeed_1234));
    let raw = oc.get_attr(&mut wrk, ObjAttr::Vxid).expect("raw");
    assert_eq!(raw, vec![0xfe, 0xed, 0x12, 0x34]);
}
