//! Probe engine tests.
//!
//! A loopback HTTP responder drives real polls; the window arithmetic
//! and healthy/sick transitions are asserted after every poll.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use objcache_core::backend::probe::{ProbeSpec, ProbeTarget};
use objcache_core::backend::{Backend, BackendConfig};

/// Serves a switchable status to every probe until dropped.
struct Responder {
    addr: SocketAddr,
    status: Arc<std::sync::atomic::AtomicU16>,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Responder {
    fn start(status: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        listener.set_nonblocking(true).expect("nonblocking");
        let stop = Arc::new(AtomicBool::new(false));
        let status = Arc::new(std::sync::atomic::AtomicU16::new(status));
        let tstop = Arc::clone(&stop);
        let tstatus = Arc::clone(&status);
        let thread = std::thread::spawn(move || {
            while !tstop.load(Ordering::Acquire) {
                match listener.accept() {
                    Ok((mut conn, _)) => {
                        let _ = conn.set_nonblocking(false);
                        let mut buf = [0u8; 1024];
                        let _ = conn.read(&mut buf);
                        let s = tstatus.load(Ordering::Acquire);
                        let _ = conn.write_all(
                            format!(
                                "HTTP/1.1 {s} X\r\nConnection: close\r\n\r\n"
                            )
                            .as_bytes(),
                        );
                    }
                    Err(_) => {
                        std::thread::sleep(std::time::Duration::from_millis(5));
                    }
                }
            }
        });
        Self {
            addr,
            status,
            stop,
            thread: Some(thread),
        }
    }

    fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::Release);
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn probe_target(addr: SocketAddr, window: u32, threshold: u32, initial: u32) -> (Arc<Backend>, Arc<ProbeTarget>) {
    let be = Backend::new(BackendConfig {
        vcl_name: "probed".into(),
        hosthdr: "probe.local".into(),
        ipv4: Some(addr),
        saintmode_threshold: u32::MAX,
        ..BackendConfig::default()
    });
    be.set_healthy(false);
    let spec = ProbeSpec {
        url: Some("/health".into()),
        timeout: 1.0,
        interval: 60.0,
        window,
        threshold,
        initial,
        ..ProbeSpec::default()
    };
    let target = ProbeTarget::new(Arc::clone(&be), spec);
    (be, target)
}

// ══════════════════════════════════════════════════════════
// 1. The good-count invariant
// ══════════════════════════════════════════════════════════

/// good == popcount(happy & window mask) after every poll.
#[test]
fn good_is_the_popcount_of_the_windowed_happy_bits() {
    let r = Responder::start(200);
    let (_be, target) = probe_target(r.addr, 4, 3, 0);
    for _ in 0..6 {
        target.poll_once();
        let w = target.window();
        assert_eq!(w.good, (w.happy & 0xF).count_ones());
    }
}

// ══════════════════════════════════════════════════════════
// 2. Transitions (scenario S6)
// ══════════════════════════════════════════════════════════

/// Two failed polls, then three successes: the backend becomes healthy
/// exactly on the third success, with the happy pattern `00111`.
#[test]
fn backend_turns_healthy_exactly_at_the_threshold() {
    let r = Responder::start(500);
    let (be, target) = probe_target(r.addr, 4, 3, 0);

    // Two polls against the broken responder.
    target.poll_once();
    target.poll_once();
    assert!(!be.is_healthy());
    assert_eq!(target.window().good, 0);

    // The backend recovers.
    r.set_status(200);
    target.poll_once();
    assert!(!be.is_healthy(), "one success of three");
    target.poll_once();
    assert!(!be.is_healthy(), "two successes of three");
    target.poll_once();
    assert!(be.is_healthy(), "healthy exactly on the third success");
    assert_eq!(target.window().happy & 0b1_1111, 0b00111);
    assert_eq!(target.window().good, 3);
}

/// It takes `window − threshold + 1` failures to take a backend down.
#[test]
fn backend_goes_sick_when_the_responder_breaks() {
    let r = Responder::start(200);
    let (be, target) = probe_target(r.addr, 4, 3, 0);
    for _ in 0..4 {
        target.poll_once();
    }
    assert!(be.is_healthy());

    // Wrong status now: expected 200, getting 500.
    r.set_status(500);
    target.poll_once();
    assert!(be.is_healthy(), "a single failed poll cannot down it");
    target.poll_once();
    assert!(!be.is_healthy(), "window − threshold + 1 failures do");
}

// ══════════════════════════════════════════════════════════
// 3. Bitmap bookkeeping
// ══════════════════════════════════════════════════════════

#[test]
fn event_bitmaps_record_the_poll_anatomy() {
    let r = Responder::start(200);
    let (_be, target) = probe_target(r.addr, 8, 3, 0);
    target.poll_once();
    let w = target.window();
    assert_eq!(w.good_ipv4 & 1, 1);
    assert_eq!(w.good_xmit & 1, 1);
    assert_eq!(w.good_recv & 1, 1);
    assert_eq!(w.happy & 1, 1);
    assert!(w.last > 0.0, "response time recorded");
    assert!(w.resp_buf.starts_with("HTTP/1.1 200"));
}

#[test]
fn wrong_status_is_an_unhappy_poll() {
    let r = Responder::start(404);
    let (_be, target) = probe_target(r.addr, 8, 3, 0);
    target.poll_once();
    let w = target.window();
    assert_eq!(w.good_recv & 1, 1, "the poll itself worked");
    assert_eq!(w.happy & 1, 0, "but the status was wrong");
}

// ══════════════════════════════════════════════════════════
// 4. Threaded lifecycle
// ══════════════════════════════════════════════════════════

#[test]
fn start_credits_initial_polls_and_stop_joins() {
    let r = Responder::start(200);
    let be = Backend::new(BackendConfig {
        vcl_name: "warm".into(),
        ipv4: Some(r.addr),
        saintmode_threshold: u32::MAX,
        ..BackendConfig::default()
    });
    let spec = ProbeSpec {
        timeout: 0.5,
        interval: 30.0,
        window: 8,
        threshold: 3,
        // Leave `initial` at the default: threshold − 1.
        ..ProbeSpec::default()
    };
    let target = ProbeTarget::start(Arc::clone(&be), spec);
    assert!(target.window().good >= 2, "initial synthetic polls credited");
    target.stop();
}
