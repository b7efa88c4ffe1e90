//! Weighted random, hash and client directors.
//!
//! The three policies share one implementation and differ only in how
//! the selection seed is derived:
//! - **random:** a fresh pseudo-random variate per request.
//! - **hash:** the low 32 bits of the request digest, so a URL maps to a
//!   stable member.
//! - **client:** SHA-256 of the client identity (or address), so a
//!   client sticks to a member.
//!
//! Selection picks the member whose weight-cumulative interval over the
//! healthy subset contains the seed. Failures retry with a
//! deterministically re-hashed seed.

use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use crate::backend::BackendConn;
use crate::common::encode::le32dec;
use crate::common::error::ConnectError;
use crate::common::rand::XorShift64;

use super::{Director, Session};

/// Seeding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criteria {
    /// Fresh randomness per request.
    Random,
    /// The request digest from the hash stage.
    Hash,
    /// The client identity (or address).
    Client,
}

/// A weighted member.
pub struct WeightedHost {
    /// The member director.
    pub backend: Arc<dyn Director>,
    /// Selection weight; must be positive.
    pub weight: f64,
}

impl std::fmt::Debug for WeightedHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightedHost")
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

/// The shared random/hash/client director.
pub struct RandomDirector {
    vcl_name: String,
    criteria: Criteria,
    retries: u32,
    hosts: Vec<WeightedHost>,
    rng: Mutex<XorShift64>,
}

impl std::fmt::Debug for RandomDirector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomDirector")
            .field("vcl_name", &self.vcl_name)
            .field("criteria", &self.criteria)
            .finish_non_exhaustive()
    }
}

/// SHA-256 of `input`, folded to a double in `[0, 1)`.
fn sha_unit(input: &[u8]) -> f64 {
    let digest = Sha256::digest(input);
    f64::from(le32dec(&digest)) / 2f64.powi(32)
}

impl RandomDirector {
    /// Creates a director with the given policy. `retries == 0` means
    /// one try per member.
    pub fn new(
        vcl_name: &str,
        criteria: Criteria,
        retries: u32,
        hosts: Vec<WeightedHost>,
    ) -> Arc<Self> {
        assert!(!hosts.is_empty());
        for h in &hosts {
            assert!(h.weight > 0.0);
        }
        let retries = if retries == 0 {
            hosts.len() as u32
        } else {
            retries
        };
        Arc::new(Self {
            vcl_name: vcl_name.to_string(),
            criteria,
            retries,
            hosts,
            rng: Mutex::new(XorShift64::seeded()),
        })
    }

    /// The initial seed for this request, per policy.
    fn init_seed(&self, sess: &Session) -> f64 {
        match self.criteria {
            Criteria::Client => {
                let id = sess.client_identity.clone().unwrap_or_else(|| {
                    sess.client_addr
                        .map(|a| a.to_string())
                        .unwrap_or_default()
                });
                sha_unit(id.as_bytes())
            }
            Criteria::Hash => {
                let digest = match sess.digest.as_ref() {
                    Some(d) => d,
                    None => panic!("hash director needs the request digest"),
                };
                f64::from(le32dec(digest)) / 2f64.powi(32)
            }
            Criteria::Random => self
                .rng
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .next_unit(),
        }
    }

    /// Picks the healthy member whose cumulative weight interval
    /// contains `r`.
    fn pick_one(
        &self,
        sess: &Session,
        r: f64,
    ) -> Option<Result<BackendConn, ConnectError>> {
        assert!((0.0..1.0).contains(&r));
        let mut w = vec![0.0; self.hosts.len()];
        let mut total = 0.0;
        for (i, h) in self.hosts.iter().enumerate() {
            if h.backend.healthy(sess.t_req, sess.target) {
                w[i] = h.weight;
            }
            total += w[i];
        }
        if total == 0.0 {
            return None;
        }
        let r = r * total;
        let mut acc = 0.0;
        for (i, h) in self.hosts.iter().enumerate() {
            acc += w[i];
            if r < acc {
                return Some(h.backend.getfd(sess));
            }
        }
        None
    }
}

impl Director for RandomDirector {
    fn name(&self) -> &'static str {
        match self.criteria {
            Criteria::Random => "random",
            Criteria::Hash => "hash",
            Criteria::Client => "client",
        }
    }

    fn vcl_name(&self) -> &str {
        &self.vcl_name
    }

    fn getfd(&self, sess: &Session) -> Result<BackendConn, ConnectError> {
        let mut r = self.init_seed(sess);
        let mut err = ConnectError::Unhealthy;
        for _ in 0..self.retries {
            match self.pick_one(sess, r) {
                Some(Ok(conn)) => return Ok(conn),
                Some(Err(e)) => err = e,
                None => {}
            }
            // Deterministically re-randomize from the failed seed.
            r = sha_unit(&r.to_ne_bytes());
        }
        Err(err)
    }

    fn healthy(&self, now: f64, target: usize) -> bool {
        self.hosts.iter().any(|h| h.backend.healthy(now, target))
    }
}
