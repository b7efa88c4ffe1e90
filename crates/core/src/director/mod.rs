//! Directors: backend selection policies.
//!
//! A director answers two questions for a request: "give me a
//! connection" and "is anything behind you healthy". The concrete
//! shapes are:
//! 1. **Simple:** One backend; where the actual connections happen.
//! 2. **Round-robin:** Rotate over members.
//! 3. **Random / hash / client:** One weighted implementation with three
//!    seeding policies.
//! 4. **DNS:** Pick members by resolving the request's Host header.
//!
//! Directors nest: every member of a composite director is itself a
//! director.

/// DNS director.
pub mod dns;
/// Weighted random/hash/client director.
pub mod random;
/// Round-robin director.
pub mod round_robin;

use std::net::IpAddr;
use std::sync::Arc;

use crate::backend::{Backend, BackendConn};
use crate::common::error::ConnectError;

/// Request-scoped inputs to backend selection.
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Request timestamp.
    pub t_req: f64,
    /// Request digest from the hash stage, if computed.
    pub digest: Option<[u8; 32]>,
    /// `client.identity`, when set.
    pub client_identity: Option<String>,
    /// Peer address.
    pub client_addr: Option<IpAddr>,
    /// Object identity for saint-mode checks (an objhead address in
    /// disguise); 0 when there is none.
    pub target: usize,
    /// Host header of the request, for the DNS director.
    pub host: Option<String>,
    /// Connect timeout override (0 = unset).
    pub connect_timeout: f64,
    /// First-byte timeout override (0 = unset).
    pub first_byte_timeout: f64,
    /// Between-bytes timeout override (0 = unset).
    pub between_bytes_timeout: f64,
}

/// The director contract.
pub trait Director: Send + Sync {
    /// Policy name (`"simple"`, `"round_robin"`, ...).
    fn name(&self) -> &'static str;

    /// The name the configuration gave this director.
    fn vcl_name(&self) -> &str;

    /// Acquires a backend connection for the session.
    fn getfd(&self, sess: &Session) -> Result<BackendConn, ConnectError>;

    /// Whether the director can serve `target` at all right now.
    fn healthy(&self, now: f64, target: usize) -> bool;
}

/// The "simple" director: wraps a single backend.
///
/// It really isn't simple — this is where connections actually happen —
/// but it pretends by hiding everything behind the backend pool.
pub struct SimpleDirector {
    vcl_name: String,
    backend: Arc<Backend>,
}

impl std::fmt::Debug for SimpleDirector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleDirector")
            .field("vcl_name", &self.vcl_name)
            .finish_non_exhaustive()
    }
}

impl SimpleDirector {
    /// Wraps `backend` under the given configuration name.
    pub fn new(vcl_name: &str, backend: Arc<Backend>) -> Arc<Self> {
        Arc::new(Self {
            vcl_name: vcl_name.to_string(),
            backend,
        })
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Director for SimpleDirector {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn vcl_name(&self) -> &str {
        &self.vcl_name
    }

    fn getfd(&self, sess: &Session) -> Result<BackendConn, ConnectError> {
        // The pool resolves the timeout fallback chain onto the
        // connection as it hands it out.
        self.backend.get_conn(sess)
    }

    fn healthy(&self, now: f64, target: usize) -> bool {
        self.backend.vbe_healthy(now, target)
    }
}
