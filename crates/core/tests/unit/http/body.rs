//! Body-mode classification tests, in priority order.

use objcache_core::http::rfc2616::{BodyStatus, body_status};
use objcache_core::http::{BerespView, Proto};

fn resp11(status: u16) -> BerespView {
    BerespView::new(Proto::Http11, status)
}

// ══════════════════════════════════════════════════════════
// 1. Bodyless responses
// ══════════════════════════════════════════════════════════

#[test]
fn head_never_has_a_body() {
    let v = resp11(200)
        .hdr("Content-Length", "100")
        .hdr("Transfer-Encoding", "chunked");
    let (bs, _) = body_status("HEAD", &v);
    assert_eq!(bs, BodyStatus::None);
}

#[test]
fn informational_and_not_modified_have_no_body() {
    for status in [100, 101, 204, 304] {
        let v = resp11(status).hdr("Content-Length", "10");
        let (bs, _) = body_status("GET", &v);
        assert_eq!(bs, BodyStatus::None, "status {status}");
    }
}

// ══════════════════════════════════════════════════════════
// 2. Transfer encodings
// ══════════════════════════════════════════════════════════

#[test]
fn chunked_wins_over_content_length() {
    let v = resp11(200)
        .hdr("Transfer-Encoding", "chunked")
        .hdr("Content-Length", "10");
    assert_eq!(body_status("GET", &v).0, BodyStatus::Chunked);
}

#[test]
fn unknown_transfer_encoding_is_an_error() {
    let v = resp11(200).hdr("Transfer-Encoding", "gzip");
    assert_eq!(body_status("GET", &v).0, BodyStatus::Error);
}

// ══════════════════════════════════════════════════════════
// 3. Length, keep-alive, EOF
// ══════════════════════════════════════════════════════════

#[test]
fn content_length_is_parsed() {
    let v = resp11(200).hdr("Content-Length", "12345");
    assert_eq!(body_status("GET", &v).0, BodyStatus::Length(12345));
}

#[test]
fn garbage_content_length_is_an_error() {
    let v = resp11(200).hdr("Content-Length", "twelve");
    assert_eq!(body_status("GET", &v).0, BodyStatus::Error);
}

#[test]
fn keep_alive_without_length_assumes_empty() {
    let v = resp11(200).hdr("Connection", "keep-alive");
    let (bs, close) = body_status("GET", &v);
    assert_eq!(bs, BodyStatus::Zero);
    assert!(!close);
}

#[test]
fn connection_close_reads_until_eof() {
    let v = resp11(200).hdr("Connection", "close");
    let (bs, close) = body_status("GET", &v);
    assert_eq!(bs, BodyStatus::Eof);
    assert!(close);
}

#[test]
fn http10_defaults_to_eof_and_close() {
    let v = BerespView::new(Proto::Http10, 200);
    let (bs, close) = body_status("GET", &v);
    assert_eq!(bs, BodyStatus::Eof);
    assert!(close);
}

#[test]
fn http10_keep_alive_stays_open() {
    let v = BerespView::new(Proto::Http10, 200).hdr("Connection", "keep-alive");
    let (bs, close) = body_status("GET", &v);
    assert_eq!(bs, BodyStatus::Zero);
    assert!(!close);
}

#[test]
fn http11_with_nothing_falls_back_to_eof() {
    let v = resp11(200);
    let (bs, close) = body_status("GET", &v);
    assert_eq!(bs, BodyStatus::Eof);
    assert!(!close);
}
