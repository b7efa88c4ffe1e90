//! Backend connection pooling and health gating.
//!
//! Each backend owns a mutex-guarded pool state: a stack of reusable
//! connections, the open-connection count, and the saint-mode trouble
//! list. Health is the conjunction of the probe verdict and saint mode:
//! 1. **Probe verdict:** The probe engine writes `healthy` as its window
//!    crosses the threshold.
//! 2. **Saint mode:** Objects that misbehaved on this backend are
//!    quarantined for a bounded time; enough quarantined objects take
//!    the backend out entirely.

/// The health probe engine.
pub mod probe;

use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::common::error::ConnectError;
use crate::config::Config;
use crate::director::Session;
use crate::stats::BackendStats;

use self::probe::ProbeTarget;

/// Static configuration of one backend.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    /// Name the configuration referred to this backend by.
    pub vcl_name: String,
    /// Value for auto-generated Host headers and probe requests.
    pub hosthdr: String,
    /// IPv4 address, if any.
    pub ipv4: Option<SocketAddr>,
    /// IPv6 address, if any.
    pub ipv6: Option<SocketAddr>,
    /// Open-connection cap; 0 = unlimited.
    pub max_conn: u32,
    /// Connect timeout override (0 = use the global parameter).
    pub connect_timeout: f64,
    /// First-byte timeout override (0 = use the global parameter).
    pub first_byte_timeout: f64,
    /// Between-bytes timeout override (0 = use the global parameter).
    pub between_bytes_timeout: f64,
    /// Saint-mode threshold override (`u32::MAX` = use the parameter).
    pub saintmode_threshold: u32,
}

/// A saint-mode quarantine entry.
#[derive(Debug, Clone, Copy)]
struct Trouble {
    /// Object identity (an objhead address in disguise).
    target: usize,
    /// Absolute expiry of the quarantine.
    timeout: f64,
}

struct PoolInner {
    connlist: Vec<TcpStream>,
    n_conn: u32,
    refcount: u64,
    /// Sorted by expiry, soonest first, so expiry scans can stop early.
    troublelist: Vec<Trouble>,
}

/// One configured backend with its connection pool.
pub struct Backend {
    cfg: BackendConfig,
    healthy: AtomicBool,
    inner: Mutex<PoolInner>,
    /// Connection statistics.
    pub stats: BackendStats,
    probe: Mutex<Option<Arc<ProbeTarget>>>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("vcl_name", &self.cfg.vcl_name)
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}

/// A connection checked out of a backend pool.
#[derive(Debug)]
pub struct BackendConn {
    stream: Option<TcpStream>,
    backend: Arc<Backend>,
    /// Resolved first-byte timeout for this transaction.
    pub first_byte_timeout: f64,
    /// Resolved between-bytes timeout for this transaction.
    pub between_bytes_timeout: f64,
}

impl BackendConn {
    /// The connected stream.
    pub fn stream(&self) -> &TcpStream {
        match self.stream.as_ref() {
            Some(s) => s,
            None => panic!("connection already returned"),
        }
    }

    /// The owning backend.
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Returns the connection for reuse.
    pub fn recycle(mut self) {
        if let Some(stream) = self.stream.take() {
            self.backend.recycle_stream(stream);
        }
    }

    /// Closes the connection.
    pub fn close(mut self) {
        if let Some(stream) = self.stream.take() {
            self.backend.close_stream(stream);
        }
    }
}

impl Drop for BackendConn {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.backend.close_stream(stream);
        }
    }
}

/// Timeout fallback chain: session override, then backend, then the
/// global parameter.
fn find_tmo(sess: f64, be: f64, param: f64) -> f64 {
    if sess != 0.0 {
        sess
    } else if be != 0.0 {
        be
    } else {
        param
    }
}

/// Checks that there is still something at the far end of a socket. Any
/// pending event means the peer closed or pipelined; either way the
/// connection is unusable.
fn check_fd(stream: &TcpStream) -> bool {
    let mut pfd = libc::pollfd {
        fd: stream.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pollfd points at a live socket fd; zero timeout.
    unsafe { libc::poll(&mut pfd, 1, 0) == 0 }
}

impl Backend {
    /// Creates a backend from its configuration.
    pub fn new(cfg: BackendConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            healthy: AtomicBool::new(true),
            inner: Mutex::new(PoolInner {
                connlist: Vec::new(),
                n_conn: 0,
                refcount: 0,
                troublelist: Vec::new(),
            }),
            stats: BackendStats::default(),
            probe: Mutex::new(None),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The configuration this backend was created from.
    pub fn config(&self) -> &BackendConfig {
        &self.cfg
    }

    /// The configured name.
    pub fn vcl_name(&self) -> &str {
        &self.cfg.vcl_name
    }

    /// Last probe verdict (or administrative setting).
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Publishes a health verdict; a stale read elsewhere is acceptable.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Open connections right now.
    pub fn n_conn(&self) -> u32 {
        self.lock().n_conn
    }

    /// Evaluates health for a specific object.
    ///
    /// With saint mode enabled, the trouble list is scanned: at most one
    /// stale entry is expired per call, a quarantined match means
    /// unhealthy, and reaching the threshold declares the whole backend
    /// unhealthy for everyone. The threshold is evaluated after the
    /// timeout check, so entries keep timing out once it is reached.
    pub fn vbe_healthy(&self, now: f64, target: usize) -> bool {
        if !self.is_healthy() {
            return false;
        }
        let threshold = if self.cfg.saintmode_threshold == u32::MAX {
            Config::get().backend.saintmode_threshold
        } else {
            self.cfg.saintmode_threshold
        };
        if threshold == 0 {
            return true;
        }
        if target == 0 {
            return true;
        }
        let mut inner = self.lock();
        let mut i = 0u32;
        let mut idx = 0;
        while idx < inner.troublelist.len() {
            let tr = inner.troublelist[idx];
            if tr.timeout < now {
                let _ = inner.troublelist.remove(idx);
                return true;
            }
            if tr.target == target {
                return false;
            }
            // A threshold of 1 means a single entry disables the
            // backend; pre-increment preserves that.
            i += 1;
            if i >= threshold {
                return false;
            }
            idx += 1;
        }
        true
    }

    /// Quarantines an object on this backend until `timeout`.
    pub fn add_trouble(&self, target: usize, timeout: f64) {
        let mut inner = self.lock();
        let pos = inner
            .troublelist
            .iter()
            .position(|t| t.timeout > timeout)
            .unwrap_or(inner.troublelist.len());
        inner.troublelist.insert(pos, Trouble { target, timeout });
    }

    /// Entries currently on the trouble list.
    pub fn trouble_len(&self) -> usize {
        self.lock().troublelist.len()
    }

    fn try_connect(&self, addr: SocketAddr, tmo: f64) -> Option<TcpStream> {
        let r = if tmo > 0.0 {
            TcpStream::connect_timeout(&addr, crate::common::time::duration(tmo))
        } else {
            TcpStream::connect(addr)
        };
        match r {
            Ok(s) => {
                debug!(backend = %self.cfg.vcl_name, %addr, "backend connection opened");
                Some(s)
            }
            Err(_) => None,
        }
    }

    /// Opens a fresh connection, preferring the address family the
    /// configuration asks for.
    fn conn_try(&self, sess: &Session) -> Result<TcpStream, ConnectError> {
        {
            let mut inner = self.lock();
            inner.refcount += 1;
            inner.n_conn += 1; // It mostly works.
        }
        let tmo = find_tmo(
            sess.connect_timeout,
            self.cfg.connect_timeout,
            Config::get().backend.connect_timeout,
        );
        let prefer6 = Config::get().backend.prefer_ipv6;
        let mut stream = None;
        if prefer6 {
            if let Some(a) = self.cfg.ipv6 {
                stream = self.try_connect(a, tmo);
            }
        }
        if stream.is_none() {
            if let Some(a) = self.cfg.ipv4 {
                stream = self.try_connect(a, tmo);
            }
        }
        if stream.is_none() && !prefer6 {
            if let Some(a) = self.cfg.ipv6 {
                stream = self.try_connect(a, tmo);
            }
        }
        match stream {
            Some(s) => Ok(s),
            None => {
                let mut inner = self.lock();
                inner.n_conn -= 1;
                inner.refcount -= 1; // Only keep the ref on success.
                if self.cfg.ipv4.is_none() && self.cfg.ipv6.is_none() {
                    Err(ConnectError::NoAddress)
                } else {
                    Err(ConnectError::Failed(std::io::Error::last_os_error()))
                }
            }
        }
    }

    /// Gets a connection for `sess`: recycle when possible, otherwise
    /// gate on health and the connection cap and connect anew.
    pub fn get_conn(
        self: &Arc<Self>,
        sess: &Session,
    ) -> Result<BackendConn, ConnectError> {
        // First look for connections we can recycle.
        loop {
            let stream = {
                let mut inner = self.lock();
                match inner.connlist.pop() {
                    Some(s) => {
                        inner.refcount += 1;
                        Some(s)
                    }
                    None => None,
                }
            };
            let Some(stream) = stream else { break };
            if check_fd(&stream) {
                BackendStats::bump(&self.stats.reuse);
                return Ok(self.wrap(stream, sess));
            }
            BackendStats::bump(&self.stats.toolate);
            self.close_stream(stream);
        }

        if !self.vbe_healthy(sess.t_req, sess.target) {
            BackendStats::bump(&self.stats.unhealthy);
            return Err(ConnectError::Unhealthy);
        }

        if self.cfg.max_conn > 0 && self.lock().n_conn >= self.cfg.max_conn {
            BackendStats::bump(&self.stats.busy);
            return Err(ConnectError::Busy);
        }

        match self.conn_try(sess) {
            Ok(stream) => {
                BackendStats::bump(&self.stats.conn);
                Ok(self.wrap(stream, sess))
            }
            Err(e) => {
                BackendStats::bump(&self.stats.fail);
                Err(e)
            }
        }
    }

    fn wrap(self: &Arc<Self>, stream: TcpStream, sess: &Session) -> BackendConn {
        let params = &Config::get().backend;
        BackendConn {
            stream: Some(stream),
            backend: Arc::clone(self),
            first_byte_timeout: find_tmo(
                sess.first_byte_timeout,
                self.cfg.first_byte_timeout,
                params.first_byte_timeout,
            ),
            between_bytes_timeout: find_tmo(
                sess.between_bytes_timeout,
                self.cfg.between_bytes_timeout,
                params.between_bytes_timeout,
            ),
        }
    }

    fn recycle_stream(&self, stream: TcpStream) {
        BackendStats::bump(&self.stats.recycle);
        let mut inner = self.lock();
        inner.connlist.push(stream);
        inner.refcount -= 1;
    }

    fn close_stream(&self, stream: TcpStream) {
        drop(stream);
        let mut inner = self.lock();
        assert!(inner.n_conn > 0);
        inner.n_conn -= 1;
        inner.refcount -= 1;
    }

    /// Starts health probing with `spec`; replaces a running probe.
    pub fn probe_start(self: &Arc<Self>, spec: probe::ProbeSpec) {
        let target = ProbeTarget::start(Arc::clone(self), spec);
        let old = self
            .probe
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(target);
        if let Some(old) = old {
            old.stop();
        }
    }

    /// Stops health probing; the backend is considered healthy again.
    pub fn probe_stop(&self) {
        let old = self
            .probe
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(old) = old {
            old.stop();
        }
        self.set_healthy(true);
    }

    /// The running probe target, if any.
    pub fn probe(&self) -> Option<Arc<ProbeTarget>> {
        self.probe
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}
