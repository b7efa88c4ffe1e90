//! DNS director: select members by resolving the request's Host header.
//!
//! The hostname (optionally with a configured suffix, port stripped) is
//! resolved and the resulting addresses are matched against the member
//! backends; matching members form a *hostgroup* that is cached with a
//! TTL. Groups are balanced round-robin. The cache is bounded; when
//! full, the oldest entry is evicted.

use std::collections::VecDeque;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::backend::BackendConn;
use crate::common::error::ConnectError;

use super::{Director, Session, SimpleDirector};

/// Upper bound on cached hostgroups.
pub const DNS_MAX_CACHE: usize = 1024;

struct HostGroup {
    hostname: String,
    /// Absolute expiry of this resolution.
    ttl: f64,
    /// Indices into the member list.
    hosts: Vec<usize>,
    next_host: usize,
}

/// The DNS director.
pub struct DnsDirector {
    vcl_name: String,
    members: Vec<Arc<SimpleDirector>>,
    /// Appended to the Host-derived name before resolution.
    suffix: String,
    /// Cache TTL, seconds.
    ttl: f64,
    /// Newest entries at the front; evicted from the back.
    cache: RwLock<VecDeque<HostGroup>>,
}

impl std::fmt::Debug for DnsDirector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsDirector")
            .field("vcl_name", &self.vcl_name)
            .field("members", &self.members.len())
            .finish_non_exhaustive()
    }
}

impl DnsDirector {
    /// Creates a director over `members` with the given suffix and TTL.
    pub fn new(
        vcl_name: &str,
        members: Vec<Arc<SimpleDirector>>,
        suffix: &str,
        ttl: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            vcl_name: vcl_name.to_string(),
            members,
            suffix: suffix.to_string(),
            ttl,
            cache: RwLock::new(VecDeque::new()),
        })
    }

    /// Derives the lookup name from the request's Host header: port
    /// stripped, suffix appended.
    fn lookup_name(&self, sess: &Session) -> Option<String> {
        let host = sess.host.as_deref()?;
        let host = host.split(':').next().unwrap_or(host);
        if host.is_empty() {
            return None;
        }
        Some(format!("{host}{}", self.suffix))
    }

    fn member_matches(&self, i: usize, addr: IpAddr) -> bool {
        let cfg = self.members[i].backend().config();
        cfg.ipv4.is_some_and(|a| a.ip() == addr)
            || cfg.ipv6.is_some_and(|a| a.ip() == addr)
    }

    /// Picks a healthy member from a group, round-robin.
    fn pick_host(
        &self,
        sess: &Session,
        group: &mut HostGroup,
    ) -> Option<Arc<SimpleDirector>> {
        if group.hosts.is_empty() {
            return None;
        }
        if group.next_host >= group.hosts.len() {
            group.next_host = 0;
        }
        let n = group.hosts.len();
        for i in 0..n {
            let cur = (group.next_host + i) % n;
            let member = &self.members[group.hosts[cur]];
            if member.healthy(sess.t_req, sess.target) {
                group.next_host = cur + 1;
                return Some(Arc::clone(member));
            }
        }
        None
    }

    /// Cache lookup. Under the write lock, the first expired entry found
    /// is also evicted.
    fn cache_has(
        &self,
        sess: &Session,
        hostname: &str,
        evict_expired: bool,
    ) -> Option<Option<Arc<SimpleDirector>>> {
        let mut cache = self
            .cache
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut expired = None;
        let mut hit = None;
        for (i, group) in cache.iter_mut().enumerate() {
            if group.ttl <= sess.t_req {
                if expired.is_none() {
                    expired = Some(i);
                }
                continue;
            }
            if group.hostname == hostname {
                hit = Some(self.pick_host(sess, group));
                break;
            }
        }
        if evict_expired {
            if let Some(i) = expired {
                let _ = cache.remove(i);
            }
        }
        hit
    }

    /// Resolves `hostname`, matches the addresses against the members
    /// and caches the resulting group (even when empty, so failures are
    /// negative-cached for the TTL).
    fn cache_add(
        &self,
        sess: &Session,
        hostname: &str,
    ) -> Option<Arc<SimpleDirector>> {
        // We may have raced another resolver while upgrading the lock.
        if let Some(hit) = self.cache_has(sess, hostname, true) {
            return hit;
        }

        let mut hosts = Vec::new();
        match (hostname, 80u16).to_socket_addrs() {
            Ok(addrs) => {
                for sa in addrs {
                    for i in 0..self.members.len() {
                        if self.member_matches(i, sa.ip()) && !hosts.contains(&i) {
                            hosts.push(i);
                        }
                    }
                }
            }
            Err(e) => {
                debug!(hostname, error = %e, "dns lookup failed");
            }
        }

        let mut group = HostGroup {
            hostname: hostname.to_string(),
            ttl: sess.t_req + self.ttl,
            hosts,
            next_host: 0,
        };
        let picked = self.pick_host(sess, &mut group);
        let mut cache = self
            .cache
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if cache.len() >= DNS_MAX_CACHE {
            let _ = cache.pop_back();
        }
        cache.push_front(group);
        picked
    }

    /// Cached groups right now (introspection).
    pub fn cache_len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn walk(&self, sess: &Session) -> Option<Arc<SimpleDirector>> {
        let hostname = self.lookup_name(sess)?;
        if let Some(hit) = self.cache_has(sess, &hostname, false) {
            return hit;
        }
        self.cache_add(sess, &hostname)
    }
}

impl Director for DnsDirector {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn vcl_name(&self) -> &str {
        &self.vcl_name
    }

    fn getfd(&self, sess: &Session) -> Result<BackendConn, ConnectError> {
        match self.walk(sess) {
            Some(member) => member.getfd(sess),
            None => Err(ConnectError::Unhealthy),
        }
    }

    /// Healthy when any cached resolution still maps to a healthy
    /// member; an empty cache falls back to scanning the members.
    fn healthy(&self, now: f64, target: usize) -> bool {
        let cache = self
            .cache
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut saw_group = false;
        for group in cache.iter() {
            if group.ttl <= now {
                continue;
            }
            saw_group = true;
            if group
                .hosts
                .iter()
                .any(|&i| self.members[i].healthy(now, target))
            {
                return true;
            }
        }
        if saw_group {
            return false;
        }
        self.members.iter().any(|m| m.healthy(now, target))
    }
}
