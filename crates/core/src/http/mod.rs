//! Minimal HTTP response view for the TTL and body classifiers.
//!
//! Wire parsing is someone else's job; this module only models what the
//! classifiers need: protocol level, status, and case-insensitive header
//! access including `Cache-Control`-style field lookup, plus HTTP date
//! parsing for `Date`/`Expires`/`Last-Modified`.

/// RFC 2616 TTL computation and body-mode classification.
pub mod rfc2616;

/// Protocol level of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Proto {
    /// HTTP/1.0 (or older).
    Http10,
    /// HTTP/1.1.
    #[default]
    Http11,
}

/// A backend response as the classifiers see it.
#[derive(Debug, Clone, Default)]
pub struct BerespView {
    /// Protocol level.
    pub proto: Proto,
    /// Status code.
    pub status: u16,
    /// Headers in arrival order.
    pub headers: Vec<(String, String)>,
}

impl BerespView {
    /// Builds a view; a convenience for tests and synthetic responses.
    pub fn new(proto: Proto, status: u16) -> Self {
        Self {
            proto,
            status,
            headers: Vec::new(),
        }
    }

    /// Appends a header.
    pub fn hdr(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// First header with the given name, case-insensitive.
    pub fn get_hdr(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim())
    }

    /// True when the header equals `value`, case-insensitive.
    pub fn hdr_is(&self, name: &str, value: &str) -> bool {
        self.get_hdr(name)
            .is_some_and(|v| v.eq_ignore_ascii_case(value))
    }

    /// Looks a field up inside a comma-separated header, e.g.
    /// `max-age` within `Cache-Control`.
    ///
    /// Returns `None` when the field is absent, `Some(None)` when it is
    /// present without a value, and `Some(Some(v))` otherwise.
    pub fn get_hdr_field(&self, name: &str, field: &str) -> Option<Option<&str>> {
        let hdr = self.get_hdr(name)?;
        for part in hdr.split(',') {
            let part = part.trim();
            let (k, v) = match part.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim().trim_matches('"'))),
                None => (part, None),
            };
            if k.eq_ignore_ascii_case(field) {
                return Some(v);
            }
        }
        None
    }
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct",
    "Nov", "Dec",
];

/// Days since the epoch for a civil date (Howard Hinnant's algorithm).
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = i64::from((m + 9) % 12);
    let doy = (153 * mp + 2) / 5 + i64::from(d) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn month_num(name: &str) -> Option<u32> {
    MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(name))
        .map(|i| i as u32 + 1)
}

fn parse_hms(s: &str) -> Option<(u32, u32, u32)> {
    let mut it = s.split(':');
    let h = it.next()?.parse().ok()?;
    let m = it.next()?.parse().ok()?;
    let sec = it.next()?.parse().ok()?;
    if it.next().is_some() || h > 23 || m > 59 || sec > 60 {
        return None;
    }
    Some((h, m, sec))
}

fn epoch(y: i64, mo: u32, d: u32, (h, mi, s): (u32, u32, u32)) -> f64 {
    (days_from_civil(y, mo, d) * 86_400
        + i64::from(h) * 3600
        + i64::from(mi) * 60
        + i64::from(s)) as f64
}

/// Parses an HTTP date in any of the three classic formats (RFC 1123,
/// RFC 850, asctime). Returns 0.0 on garbage, which callers treat as
/// "header not usable".
pub fn parse_date(s: &str) -> f64 {
    let s = s.trim();
    let fields: Vec<&str> = s.split_ascii_whitespace().collect();

    // RFC 1123: Sun, 06 Nov 1994 08:49:37 GMT
    if fields.len() >= 5 && fields[0].ends_with(',') {
        if let (Ok(d), Some(mo), Ok(y), Some(hms)) = (
            fields[1].parse::<u32>(),
            month_num(fields[2]),
            fields[3].parse::<i64>(),
            parse_hms(fields[4]),
        ) {
            if (1..=31).contains(&d) {
                return epoch(y, mo, d, hms);
            }
        }
        // RFC 850: Sunday, 06-Nov-94 08:49:37 GMT
        let dmy: Vec<&str> = fields[1].split('-').collect();
        if dmy.len() == 3 && fields.len() >= 3 {
            if let (Ok(d), Some(mo), Ok(mut y), Some(hms)) = (
                dmy[0].parse::<u32>(),
                month_num(dmy[1]),
                dmy[2].parse::<i64>(),
                parse_hms(fields[2]),
            ) {
                if y < 100 {
                    y += if y < 70 { 2000 } else { 1900 };
                }
                if (1..=31).contains(&d) {
                    return epoch(y, mo, d, hms);
                }
            }
        }
        return 0.0;
    }

    // asctime: Sun Nov  6 08:49:37 1994
    if fields.len() == 5 {
        if let (Some(mo), Ok(d), Some(hms), Ok(y)) = (
            month_num(fields[1]),
            fields[2].parse::<u32>(),
            parse_hms(fields[3]),
            fields[4].parse::<i64>(),
        ) {
            if (1..=31).contains(&d) {
                return epoch(y, mo, d, hms);
            }
        }
    }
    0.0
}
