//! Defensive TTL computation and body-mode classification.
//!
//! RFC 2616 has a lot to say about cache TTLs, but it assumes a cache
//! with no relationship to the origin. A server-side cache cannot stop
//! caching on the first sign of clock skew, so the policy here is RFC
//! compliant when the clocks agree and falls back as gracefully as
//! possible when they do not: a relative TTL can still be derived from
//! `Expires − Date` even when both are far from our own clock.

use tracing::debug;

use crate::config::Config;

use super::{BerespView, Proto, parse_date};

/// Inputs and outcome of one TTL computation, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TtlResult {
    /// The computed TTL in seconds; negative means uncacheable.
    pub ttl: f64,
    /// The response's Age, seconds.
    pub age: u32,
    /// Parsed Date header (0 = absent/garbage).
    pub h_date: f64,
    /// Parsed Expires header (0 = absent/garbage).
    pub h_expires: f64,
    /// Effective max-age, when one was present.
    pub max_age: Option<u32>,
}

/// Status codes eligible for a positive TTL.
fn cacheable_status(status: u16) -> bool {
    matches!(status, 200 | 203 | 300 | 301 | 302 | 307 | 404 | 410)
}

/// Computes the TTL for a backend response received at `entered`.
pub fn ttl(xid: u64, hp: &BerespView, entered: f64) -> TtlResult {
    let params = &Config::get().params;
    assert!(entered != 0.0 && !entered.is_nan());

    // If all else fails, cache using the default TTL.
    let mut ttl = params.default_ttl;
    let mut max_age = None;

    let age: u32 = hp
        .get_hdr("Age")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    let h_expires = hp.get_hdr("Expires").map_or(0.0, parse_date);
    let h_date = hp.get_hdr("Date").map_or(0.0, parse_date);

    if !cacheable_status(hp.status) {
        ttl = -1.0;
    } else {
        // A relative specification from the backend takes precedence.
        let ma = hp
            .get_hdr_field("Cache-Control", "s-maxage")
            .or_else(|| hp.get_hdr_field("Cache-Control", "max-age"))
            .flatten();
        if let Some(ma) = ma {
            let ma: u32 = if ma.starts_with('-') {
                0
            } else {
                ma.parse().unwrap_or(0)
            };
            max_age = Some(ma);
            ttl = if age > ma { 0.0 } else { f64::from(ma - age) };
        } else if h_expires == 0.0 {
            // No expiry information; keep the default.
        } else if h_expires < h_date {
            // The backend says it is expired already.
            ttl = 0.0;
        } else if h_date == 0.0 || (h_date - entered).abs() < params.clock_skew {
            // No Date, or one close enough to our clock that we can
            // trust Expires relative to ourselves.
            ttl = if h_expires < entered {
                0.0
            } else {
                h_expires - entered
            };
        } else {
            // Clocks are out of whack, but the two headers still give a
            // usable relative time.
            ttl = (h_expires - h_date).trunc();
        }
    }

    let r = TtlResult {
        ttl,
        age,
        h_date,
        h_expires,
        max_age,
    };
    debug!(
        xid,
        ttl = r.ttl,
        entered,
        age = r.age,
        date = r.h_date,
        expires = r.h_expires,
        max_age = r.max_age.unwrap_or(0),
        "RFC ttl"
    );
    r
}

/// How the response body will arrive, in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyStatus {
    /// No body at all.
    None,
    /// Chunked transfer encoding.
    Chunked,
    /// Exactly this many bytes.
    Length(u64),
    /// Read until the peer closes.
    Eof,
    /// Keep-alive with neither length nor encoding: assume empty.
    Zero,
    /// Unsupported transfer encoding.
    Error,
}

/// Classifies how (and whether) the response carries a body, and whether
/// the backend connection must be closed afterwards.
pub fn body_status(req_method: &str, hp: &BerespView) -> (BodyStatus, bool) {
    let do_close = if hp.proto == Proto::Http10 && !hp.hdr_is("Connection", "keep-alive")
    {
        true
    } else {
        hp.hdr_is("Connection", "close")
    };

    // A HEAD reply never has a body, no matter what the headers say.
    if req_method.eq_ignore_ascii_case("head") {
        return (BodyStatus::None, do_close);
    }

    // 1xx, 204 and 304 never have a body.
    if hp.status <= 199 || hp.status == 204 || hp.status == 304 {
        return (BodyStatus::None, do_close);
    }

    if hp.hdr_is("Transfer-Encoding", "chunked") {
        return (BodyStatus::Chunked, do_close);
    }
    if hp.get_hdr("Transfer-Encoding").is_some() {
        return (BodyStatus::Error, do_close);
    }

    if let Some(cl) = hp.get_hdr("Content-Length") {
        return match cl.trim().parse() {
            Ok(n) => (BodyStatus::Length(n), do_close),
            Err(_) => (BodyStatus::Error, do_close),
        };
    }

    if hp.hdr_is("Connection", "keep-alive") {
        // Keep-alive with neither chunking nor a length is impossible;
        // assume a zero length body.
        return (BodyStatus::Zero, do_close);
    }

    // Connection: close, HTTP/1.0, or no information: read what comes.
    (BodyStatus::Eof, do_close)
}
