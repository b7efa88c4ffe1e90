//! Backend connection pool tests.
//!
//! Uses a loopback listener; the accept side holds sockets open (or
//! closes them) to drive the reuse / too-late paths.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc;

use objcache_core::backend::{Backend, BackendConfig};
use objcache_core::common::error::ConnectError;
use objcache_core::director::Session;

/// A listener that keeps accepted sockets alive until told otherwise.
struct AcceptKeeper {
    addr: SocketAddr,
    conns: mpsc::Receiver<TcpStream>,
    _thread: std::thread::JoinHandle<()>,
}

fn keeper() -> AcceptKeeper {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, rx) = mpsc::channel();
    let thread = std::thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(conn) = conn else { break };
            if tx.send(conn).is_err() {
                break;
            }
        }
    });
    AcceptKeeper {
        addr,
        conns: rx,
        _thread: thread,
    }
}

fn backend_for(addr: SocketAddr, max_conn: u32) -> Arc<Backend> {
    Backend::new(BackendConfig {
        vcl_name: "test".into(),
        hosthdr: "test.local".into(),
        ipv4: Some(addr),
        max_conn,
        connect_timeout: 1.0,
        saintmode_threshold: u32::MAX,
        ..BackendConfig::default()
    })
}

fn sess() -> Session {
    Session {
        t_req: objcache_core::common::time::real(),
        ..Session::default()
    }
}

// ══════════════════════════════════════════════════════════
// 1. Connect, recycle, reuse
// ══════════════════════════════════════════════════════════

#[test]
fn recycled_connections_are_reused() {
    let k = keeper();
    let be = backend_for(k.addr, 0);

    let conn = be.get_conn(&sess()).expect("connect");
    let _server_side = k.conns.recv().expect("accepted");
    conn.recycle();

    let conn2 = be.get_conn(&sess()).expect("reuse");
    assert_eq!(
        be.stats.reuse.load(std::sync::atomic::Ordering::Relaxed),
        1
    );
    assert_eq!(
        be.stats.conn.load(std::sync::atomic::Ordering::Relaxed),
        1,
        "no second connect happened"
    );
    conn2.close();
    assert_eq!(be.n_conn(), 0);
}

#[test]
fn dead_pooled_connections_are_discarded() {
    let k = keeper();
    let be = backend_for(k.addr, 0);

    let conn = be.get_conn(&sess()).expect("connect");
    let server_side = k.conns.recv().expect("accepted");
    conn.recycle();
    // Peer closes while the connection sits in the pool; the zero
    // timeout poll sees the EOF and the pool discards it.
    drop(server_side);
    std::thread::sleep(std::time::Duration::from_millis(50));

    let conn2 = be.get_conn(&sess()).expect("fresh connect");
    assert_eq!(
        be.stats.toolate.load(std::sync::atomic::Ordering::Relaxed),
        1
    );
    assert_eq!(
        be.stats.conn.load(std::sync::atomic::Ordering::Relaxed),
        2
    );
    conn2.close();
}

// ══════════════════════════════════════════════════════════
// 2. Gating
// ══════════════════════════════════════════════════════════

#[test]
fn max_conn_gates_new_connections() {
    let k = keeper();
    let be = backend_for(k.addr, 1);

    let conn = be.get_conn(&sess()).expect("first");
    let _srv = k.conns.recv().expect("accepted");
    let err = be.get_conn(&sess()).expect_err("gated");
    assert!(matches!(err, ConnectError::Busy));
    conn.close();
    let conn2 = be.get_conn(&sess()).expect("after close");
    conn2.close();
}

#[test]
fn unhealthy_backends_refuse() {
    let k = keeper();
    let be = backend_for(k.addr, 0);
    be.set_healthy(false);
    let err = be.get_conn(&sess()).expect_err("sick");
    assert!(matches!(err, ConnectError::Unhealthy));
    assert_eq!(
        be.stats.unhealthy.load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[test]
fn connect_failure_is_reported() {
    // Bind then drop, so the port is (very likely) closed.
    let addr = {
        let l = TcpListener::bind("127.0.0.1:0").expect("bind");
        l.local_addr().expect("addr")
    };
    let be = backend_for(addr, 0);
    let err = be.get_conn(&sess()).expect_err("refused");
    assert!(matches!(err, ConnectError::Failed(_)));
    assert_eq!(be.n_conn(), 0, "failed connect does not leak the count");
}

// ══════════════════════════════════════════════════════════
// 3. Timeout resolution
// ══════════════════════════════════════════════════════════

#[test]
fn timeouts_fall_back_session_backend_param() {
    let k = keeper();
    let be = Backend::new(BackendConfig {
        vcl_name: "tmo".into(),
        ipv4: Some(k.addr),
        first_byte_timeout: 11.0,
        saintmode_threshold: u32::MAX,
        ..BackendConfig::default()
    });

    // Session override wins.
    let mut s = sess();
    s.first_byte_timeout = 5.0;
    s.between_bytes_timeout = 6.0;
    let conn = be.get_conn(&s).expect("connect");
    assert_eq!(conn.first_byte_timeout, 5.0);
    assert_eq!(conn.between_bytes_timeout, 6.0);
    conn.close();

    // Backend value beats the parameter; the parameter fills the rest.
    let conn = be.get_conn(&sess()).expect("connect");
    assert_eq!(conn.first_byte_timeout, 11.0);
    assert_eq!(
        conn.between_bytes_timeout,
        objcache_core::Config::get().backend.between_bytes_timeout
    );
    conn.close();
}

// ══════════════════════════════════════════════════════════
// 4. Saint mode
// ══════════════════════════════════════════════════════════

#[test]
fn quarantined_objects_see_the_backend_as_sick() {
    let be = Backend::new(BackendConfig {
        vcl_name: "saint".into(),
        saintmode_threshold: 5,
        ..BackendConfig::default()
    });
    let now = 1000.0;
    be.add_trouble(0x1000, now + 30.0);

    assert!(!be.vbe_healthy(now, 0x1000), "quarantined object");
    assert!(be.vbe_healthy(now, 0x2000), "other objects unaffected");
    assert!(be.vbe_healthy(now, 0), "no object, no saint mode");
}

#[test]
fn reaching_the_threshold_disables_the_backend() {
    let be = Backend::new(BackendConfig {
        vcl_name: "saint2".into(),
        saintmode_threshold: 2,
        ..BackendConfig::default()
    });
    let now = 1000.0;
    be.add_trouble(1, now + 30.0);
    be.add_trouble(2, now + 40.0);
    assert!(
        !be.vbe_healthy(now, 0x9999),
        "threshold reached: sick for everyone"
    );
}

#[test]
fn a_threshold_of_one_disables_on_a_single_entry() {
    let be = Backend::new(BackendConfig {
        vcl_name: "saint3".into(),
        saintmode_threshold: 1,
        ..BackendConfig::default()
    });
    be.add_trouble(1, 2000.0);
    assert!(!be.vbe_healthy(1000.0, 42));
}

#[test]
fn stale_entries_expire_one_per_call() {
    let be = Backend::new(BackendConfig {
        vcl_name: "saint4".into(),
        saintmode_threshold: 10,
        ..BackendConfig::default()
    });
    be.add_trouble(1, 100.0);
    be.add_trouble(2, 200.0);
    assert_eq!(be.trouble_len(), 2);

    // Both entries are stale at t=500; each healthy call removes one.
    assert!(be.vbe_healthy(500.0, 7));
    assert_eq!(be.trouble_len(), 1);
    assert!(be.vbe_healthy(500.0, 7));
    assert_eq!(be.trouble_len(), 0);
}

#[test]
fn entries_are_kept_in_expiry_order() {
    let be = Backend::new(BackendConfig {
        vcl_name: "saint5".into(),
        saintmode_threshold: 10,
        ..BackendConfig::default()
    });
    be.add_trouble(1, 300.0);
    be.add_trouble(2, 100.0);
    be.add_trouble(3, 200.0);
    // The soonest entry (t=100) is the one expired first.
    assert!(be.vbe_healthy(150.0, 99));
    assert_eq!(be.trouble_len(), 2);
    assert!(!be.vbe_healthy(150.0, 3), "target match still quarantined");
}
