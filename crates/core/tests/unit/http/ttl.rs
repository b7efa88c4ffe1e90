//! TTL computation tests.
//!
//! The reference instant is `Sun, 06 Nov 1994 08:49:37 GMT`
//! (784111777), so absolute-date arithmetic stays exact.

use rstest::rstest;

use objcache_core::http::rfc2616::ttl;
use objcache_core::http::{BerespView, Proto};

const ENTERED: f64 = 784_111_777.0;
const DATE: &str = "Sun, 06 Nov 1994 08:49:37 GMT";
const EXPIRES_1H: &str = "Sun, 06 Nov 1994 09:49:37 GMT";
const EXPIRES_PAST: &str = "Sun, 06 Nov 1994 07:49:37 GMT";

fn resp(status: u16) -> BerespView {
    BerespView::new(Proto::Http11, status)
}

// ══════════════════════════════════════════════════════════
// 1. max-age family
// ══════════════════════════════════════════════════════════

#[test]
fn max_age_minus_age() {
    let v = resp(200)
        .hdr("Cache-Control", "max-age=300")
        .hdr("Age", "40");
    let r = ttl(1, &v, ENTERED);
    assert_eq!(r.ttl, 260.0);
    assert_eq!(r.age, 40);
    assert_eq!(r.max_age, Some(300));
}

#[test]
fn age_beyond_max_age_clamps_to_zero() {
    let v = resp(200)
        .hdr("Cache-Control", "max-age=30")
        .hdr("Age", "31");
    assert_eq!(ttl(2, &v, ENTERED).ttl, 0.0);
}

#[test]
fn s_maxage_wins_over_max_age() {
    let v = resp(200).hdr("Cache-Control", "max-age=100, s-maxage=700");
    assert_eq!(ttl(3, &v, ENTERED).ttl, 700.0);
}

#[test]
fn negative_max_age_counts_as_zero() {
    let v = resp(200).hdr("Cache-Control", "max-age=-5");
    assert_eq!(ttl(4, &v, ENTERED).ttl, 0.0);
}

#[test]
fn max_age_beats_expires() {
    let v = resp(200)
        .hdr("Cache-Control", "max-age=120")
        .hdr("Date", DATE)
        .hdr("Expires", EXPIRES_1H);
    assert_eq!(ttl(5, &v, ENTERED).ttl, 120.0);
}

// ══════════════════════════════════════════════════════════
// 2. Expires / Date
// ══════════════════════════════════════════════════════════

#[test]
fn expires_before_date_is_uncacheable_now() {
    let v = resp(200).hdr("Date", DATE).hdr("Expires", EXPIRES_PAST);
    assert_eq!(ttl(6, &v, ENTERED).ttl, 0.0);
}

#[test]
fn trusted_expires_is_relative_to_our_clock() {
    // Date within the skew window of our clock.
    let v = resp(200).hdr("Date", DATE).hdr("Expires", EXPIRES_1H);
    assert_eq!(ttl(7, &v, ENTERED).ttl, 3600.0);
}

#[test]
fn expires_without_date_uses_our_clock() {
    let v = resp(200).hdr("Expires", EXPIRES_1H);
    assert_eq!(ttl(8, &v, ENTERED).ttl, 3600.0);
}

#[test]
fn past_expires_under_our_clock_is_zero() {
    let v = resp(200).hdr("Expires", EXPIRES_PAST);
    assert_eq!(ttl(9, &v, ENTERED).ttl, 0.0);
}

#[test]
fn skewed_clocks_fall_back_to_relative_ttl() {
    // The backend's clock is an hour off; Expires − Date still gives a
    // usable relative hour.
    let skewed_entered = ENTERED + 3600.0;
    let v = resp(200).hdr("Date", DATE).hdr("Expires", EXPIRES_1H);
    let r = ttl(10, &v, skewed_entered);
    assert_eq!(r.ttl, 3600.0);
}

#[test]
fn no_information_yields_the_default_ttl() {
    let r = ttl(11, &resp(200), ENTERED);
    assert_eq!(r.ttl, objcache_core::Config::get().params.default_ttl);
}

// ══════════════════════════════════════════════════════════
// 3. Status gating
// ══════════════════════════════════════════════════════════

#[rstest]
#[case(200)]
#[case(203)]
#[case(300)]
#[case(301)]
#[case(302)]
#[case(307)]
#[case(404)]
#[case(410)]
fn cacheable_statuses_get_positive_ttl(#[case] status: u16) {
    let v = BerespView::new(Proto::Http11, status).hdr("Cache-Control", "max-age=60");
    assert_eq!(ttl(12, &v, ENTERED).ttl, 60.0);
}

#[rstest]
#[case(201)]
#[case(206)]
#[case(303)]
#[case(500)]
#[case(503)]
fn other_statuses_are_uncacheable(#[case] status: u16) {
    let v = BerespView::new(Proto::Http11, status).hdr("Cache-Control", "max-age=60");
    assert_eq!(ttl(13, &v, ENTERED).ttl, -1.0);
}
