//! The health probe engine.
//!
//! One thread per probed backend polls it on a fixed interval and keeps
//! 64-bit rolling bitmaps of everything that happened: connect success
//! per address family, transmit and receive outcomes, and the aggregate
//! `happy` verdict. Health is decided by counting happy bits inside the
//! window: crossing the threshold in either direction flips the backend
//! between healthy and sick.
//!
//! Probing deliberately bypasses the connection pool so it measures the
//! backend without local distractions. Shutdown is cooperative: the
//! stop flag is polled between sleep slices and every network wait is
//! bounded.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tracing::info;

use crate::common::time;
use crate::config::Config;

use super::Backend;

/// Averaging rate for response times; pretty responsive.
const AVG_RATE: f64 = 4.0;

/// Response window examined for the status line.
const RESP_BUF: usize = 128;

/// Sleep slice while waiting out the probe interval, so a stop request
/// is honored promptly.
const STOP_SLICE: f64 = 0.1;

/// A probe specification, usually embedded in backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeSpec {
    /// URL probed with a generated GET request (`request` wins).
    #[serde(default)]
    pub url: Option<String>,
    /// Fully spelled-out probe request, overriding `url`.
    #[serde(default)]
    pub request: Option<String>,
    /// Probe timeout in seconds (0 = default).
    #[serde(default)]
    pub timeout: f64,
    /// Poll interval in seconds (0 = default).
    #[serde(default)]
    pub interval: f64,
    /// Rolling window size in polls (0 = default, at most 64).
    #[serde(default)]
    pub window: u32,
    /// Happy polls within the window required for healthy (0 = default).
    #[serde(default)]
    pub threshold: u32,
    /// Synthetic happy polls credited at start (`u32::MAX` = default).
    #[serde(default = "ProbeSpec::default_initial")]
    pub initial: u32,
    /// Expected HTTP status (0 = default).
    #[serde(default)]
    pub exp_status: u16,
    /// Expect the backend to close the connection after the response.
    #[serde(default)]
    pub exp_close: bool,
}

impl Default for ProbeSpec {
    fn default() -> Self {
        Self {
            url: None,
            request: None,
            timeout: 0.0,
            interval: 0.0,
            window: 0,
            threshold: 0,
            initial: u32::MAX,
            exp_status: 0,
            exp_close: false,
        }
    }
}

impl ProbeSpec {
    fn default_initial() -> u32 {
        u32::MAX
    }

    /// Fills unset fields from the configured defaults and clamps the
    /// window/threshold/initial relations.
    pub fn sanitized(&self) -> ProbeSpec {
        let d = &Config::get().probe;
        let mut s = self.clone();
        if s.timeout == 0.0 {
            s.timeout = d.timeout;
        }
        if s.interval == 0.0 {
            s.interval = d.interval;
        }
        if s.window == 0 {
            s.window = d.window;
        }
        s.window = s.window.min(64);
        if s.threshold == 0 {
            s.threshold = d.threshold;
        }
        s.threshold = s.threshold.min(s.window);
        if s.exp_status == 0 {
            s.exp_status = d.exp_status;
        }
        if s.initial == u32::MAX {
            s.initial = s.threshold.saturating_sub(1);
        }
        s.initial = s.initial.min(s.threshold);
        s
    }

    /// Builds the request bytes: an explicit `request` wins, otherwise a
    /// GET on `url` with the backend's Host header.
    pub fn build_request(&self, hosthdr: &str) -> Vec<u8> {
        if let Some(r) = &self.request {
            return r.clone().into_bytes();
        }
        let mut req = format!(
            "GET {} HTTP/1.1\r\n",
            self.url.as_deref().unwrap_or("/")
        );
        if !hosthdr.is_empty() {
            req.push_str(&format!("Host: {hosthdr}\r\n"));
        }
        req.push_str("Connection: close\r\n\r\n");
        req.into_bytes()
    }
}

/// Rolling event bitmaps and derived health state. Bit 0 is the latest
/// poll; every poll shifts everything left by one.
#[derive(Debug, Default, Clone)]
pub struct ProbeWindow {
    /// Aggregate verdict per poll.
    pub happy: u64,
    /// IPv4 connect succeeded.
    pub good_ipv4: u64,
    /// IPv6 connect succeeded.
    pub good_ipv6: u64,
    /// Request transmitted in full.
    pub good_xmit: u64,
    /// Request transmission failed.
    pub err_xmit: u64,
    /// Response received.
    pub good_recv: u64,
    /// Response receive failed.
    pub err_recv: u64,
    /// The backend closed the connection after responding.
    pub resp_close: u64,
    /// Happy bits within the configured window, after the last poll.
    pub good: u32,
    /// Response time of the last good poll, seconds.
    pub last: f64,
    /// Exponentially averaged response time, seconds.
    pub avg: f64,
    rate: f64,
    /// First line of the last response.
    pub resp_buf: String,
}

impl ProbeWindow {
    fn shift(&mut self) {
        self.happy <<= 1;
        self.good_ipv4 <<= 1;
        self.good_ipv6 <<= 1;
        self.good_xmit <<= 1;
        self.err_xmit <<= 1;
        self.good_recv <<= 1;
        self.err_recv <<= 1;
        self.resp_close <<= 1;
        self.last = 0.0;
        self.resp_buf.clear();
    }

    /// Renders one bitmap as the classic 64-column window string.
    pub fn render(map: u64, ch: char) -> String {
        let mut s = String::with_capacity(64);
        let mut bit = 1u64 << 63;
        while bit != 0 {
            s.push(if map & bit != 0 { ch } else { '-' });
            bit >>= 1;
        }
        s
    }
}

/// A probed backend: the thread, its window state and the stop flag.
pub struct ProbeTarget {
    backend: Arc<Backend>,
    spec: ProbeSpec,
    req: Vec<u8>,
    stop: AtomicBool,
    window: Mutex<ProbeWindow>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for ProbeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeTarget")
            .field("backend", &self.backend.vcl_name())
            .finish_non_exhaustive()
    }
}

fn connect_with_budget(addr: SocketAddr, deadline: f64) -> Option<TcpStream> {
    let tmo = deadline - time::real();
    if tmo <= 0.0 {
        return None;
    }
    TcpStream::connect_timeout(&addr, time::duration(tmo)).ok()
}

impl ProbeTarget {
    /// Creates a target without starting the thread (testing and
    /// single-stepping).
    pub fn new(backend: Arc<Backend>, spec: ProbeSpec) -> Arc<Self> {
        let spec = spec.sanitized();
        let req = spec.build_request(&backend.config().hosthdr);
        Arc::new(Self {
            backend,
            spec,
            req,
            stop: AtomicBool::new(false),
            window: Mutex::new(ProbeWindow::default()),
            thread: Mutex::new(None),
        })
    }

    /// Creates a target, credits the initial synthetic polls and starts
    /// the probe thread.
    pub fn start(backend: Arc<Backend>, spec: ProbeSpec) -> Arc<Self> {
        let this = Self::new(backend, spec);
        // Warm the window up so a backend is not stuck sick for a whole
        // window after startup.
        for _ in 0..this.spec.initial {
            {
                let mut w = this.lock_window();
                w.shift();
                w.happy |= 1;
            }
            this.judge();
        }
        let t = Arc::clone(&this);
        let handle = std::thread::Builder::new()
            .name(format!("probe-{}", t.backend.vcl_name()))
            .spawn(move || t.thread_main());
        if let Ok(h) = handle {
            *this
                .thread
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(h);
        }
        this
    }

    /// The effective (sanitized) spec.
    pub fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    /// Snapshot of the window state.
    pub fn window(&self) -> ProbeWindow {
        self.lock_window().clone()
    }

    fn lock_window(&self) -> std::sync::MutexGuard<'_, ProbeWindow> {
        self.window
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Requests shutdown and joins the thread.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(h) = handle {
            let _ = h.join();
        }
    }

    fn thread_main(self: Arc<Self>) {
        while !self.stop.load(Ordering::Acquire) {
            self.poll_once();
            let mut slept = 0.0;
            while slept < self.spec.interval && !self.stop.load(Ordering::Acquire)
            {
                let slice = STOP_SLICE.min(self.spec.interval - slept);
                time::sleep(slice);
                slept += slice;
            }
        }
    }

    /// One full poll: shift, poke, judge. Public so tests and the CLI
    /// can single-step the engine.
    pub fn poll_once(&self) {
        self.lock_window().shift();
        self.poke();
        self.judge();
    }

    /// Pokes the backend once, possibly at both address families,
    /// recording events into the bitmaps.
    fn poke(&self) {
        let cfg = self.backend.config();
        let t_start = time::real();
        let deadline = t_start + self.spec.timeout;
        let prefer6 = Config::get().backend.prefer_ipv6;

        let mut stream = None;
        let mut order: Vec<(SocketAddr, bool)> = Vec::new();
        if prefer6 {
            if let Some(a) = cfg.ipv6 {
                order.push((a, true));
            }
            if let Some(a) = cfg.ipv4 {
                order.push((a, false));
            }
        } else {
            if let Some(a) = cfg.ipv4 {
                order.push((a, false));
            }
            if let Some(a) = cfg.ipv6 {
                order.push((a, true));
            }
        }
        for (addr, is6) in order {
            if stream.is_some() {
                break;
            }
            if let Some(s) = connect_with_budget(addr, deadline) {
                let mut w = self.lock_window();
                if is6 {
                    w.good_ipv6 |= 1;
                } else {
                    w.good_ipv4 |= 1;
                }
                stream = Some(s);
            }
        }
        let Some(mut stream) = stream else {
            // Got no connection: failed.
            return;
        };
        let budget = deadline - time::real();
        if budget <= 0.0 {
            // Spent too long getting it.
            return;
        }

        // Send the request with what remains of the budget.
        let _ = stream.set_write_timeout(Some(time::duration(budget)));
        if stream.write_all(&self.req).is_err() {
            self.lock_window().err_xmit |= 1;
            return;
        }
        self.lock_window().good_xmit |= 1;

        // Read until EOF or timeout; only the first bytes matter.
        let mut buf = [0u8; RESP_BUF];
        let mut rlen = 0usize;
        let mut sink = [0u8; 8192];
        let mut got_eof = false;
        loop {
            let budget = deadline - time::real();
            if budget <= 0.0 {
                return;
            }
            let _ = stream.set_read_timeout(Some(time::duration(budget)));
            let r = if rlen < buf.len() {
                stream.read(&mut buf[rlen..])
            } else {
                stream.read(&mut sink)
            };
            match r {
                Ok(0) => {
                    got_eof = true;
                    break;
                }
                Ok(n) => {
                    if rlen < buf.len() {
                        rlen += n;
                    }
                }
                Err(_) => {
                    self.lock_window().err_recv |= 1;
                    return;
                }
            }
        }
        if rlen == 0 {
            return;
        }

        // So we have a good receive...
        let elapsed = time::real() - t_start;
        {
            let mut w = self.lock_window();
            w.last = elapsed;
            w.good_recv |= 1;
            if got_eof {
                w.resp_close |= 1;
            }
        }

        // Now find out if we like the response.
        let line = String::from_utf8_lossy(&buf[..rlen]);
        let line = line.split(['\r', '\n']).next().unwrap_or("");
        let status = parse_status_line(line);
        {
            let mut w = self.lock_window();
            w.resp_buf = line.to_string();
            if status == Some(self.spec.exp_status) {
                if self.spec.exp_close && !got_eof {
                    // Expected a close and did not get one.
                } else {
                    w.happy |= 1;
                }
            }
        }
    }

    /// Updates the average, counts the window and publishes the verdict.
    fn judge(&self) {
        let (good, transition) = {
            let mut w = self.lock_window();
            if w.happy & 1 != 0 {
                if w.rate < AVG_RATE {
                    w.rate += 1.0;
                }
                w.avg += (w.last - w.avg) / w.rate;
            }
            let mask = if self.spec.window >= 64 {
                u64::MAX
            } else {
                (1u64 << self.spec.window) - 1
            };
            w.good = (w.happy & mask).count_ones();
            (w.good, w.good >= self.spec.threshold)
        };

        let was = self.backend.is_healthy();
        self.backend.set_healthy(transition);
        let logmsg = match (was, transition) {
            (true, true) => "Still healthy",
            (false, true) => "Back healthy",
            (true, false) => "Went sick",
            (false, false) => "Still sick",
        };
        info!(
            backend = self.backend.vcl_name(),
            verdict = logmsg,
            good,
            threshold = self.spec.threshold,
            window = self.spec.window,
            "probe"
        );
    }
}

/// Parses `HTTP/<ver> <status> ...`.
fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.split_ascii_whitespace();
    let proto = parts.next()?;
    if !proto.starts_with("HTTP/") {
        return None;
    }
    let _: f64 = proto[5..].parse().ok()?;
    parts.next()?.parse().ok()
}
