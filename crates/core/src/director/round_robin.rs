//! Round-robin director.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::backend::BackendConn;
use crate::common::error::ConnectError;

use super::{Director, Session};

/// Rotates over its members, skipping unhealthy ones.
pub struct RoundRobinDirector {
    vcl_name: String,
    hosts: Vec<Arc<dyn Director>>,
    /// Rotation hint. Deliberately unlocked: a torn or stale read just
    /// starts the scan at a slightly wrong member.
    next_host: AtomicUsize,
}

impl std::fmt::Debug for RoundRobinDirector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundRobinDirector")
            .field("vcl_name", &self.vcl_name)
            .field("nhosts", &self.hosts.len())
            .finish_non_exhaustive()
    }
}

impl RoundRobinDirector {
    /// Creates a director over `hosts`.
    pub fn new(vcl_name: &str, hosts: Vec<Arc<dyn Director>>) -> Arc<Self> {
        assert!(!hosts.is_empty());
        Arc::new(Self {
            vcl_name: vcl_name.to_string(),
            hosts,
            next_host: AtomicUsize::new(0),
        })
    }
}

impl Director for RoundRobinDirector {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn vcl_name(&self) -> &str {
        &self.vcl_name
    }

    fn getfd(&self, sess: &Session) -> Result<BackendConn, ConnectError> {
        let mut err = ConnectError::Unhealthy;
        for _ in 0..self.hosts.len() {
            let i = self.next_host.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
            let host = &self.hosts[i];
            if !host.healthy(sess.t_req, sess.target) {
                continue;
            }
            match host.getfd(sess) {
                Ok(conn) => return Ok(conn),
                Err(e) => err = e,
            }
        }
        Err(err)
    }

    fn healthy(&self, now: f64, target: usize) -> bool {
        self.hosts.iter().any(|h| h.healthy(now, target))
    }
}
