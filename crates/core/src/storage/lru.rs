//! Per-stevedore LRU list and nuking.
//!
//! Every stevedore with reclaimable storage owns one LRU list. Objects
//! enter when their fetch completes, move to the hot end on (rate
//! limited) touches, and leave on free. Under allocation pressure
//! [`Lru::nuke_one`] evicts the coldest idle object so the allocation can
//! be retried.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::Config;
use crate::obj::ObjCore;
use crate::obj::attr::oc_flags;
use crate::stats::Worker;

/// An LRU list: cold objects at the front, hot at the back.
pub struct Lru {
    list: Mutex<VecDeque<Arc<ObjCore>>>,
}

impl std::fmt::Debug for Lru {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lru").field("len", &self.len()).finish()
    }
}

impl Default for Lru {
    fn default() -> Self {
        Self::new()
    }
}

impl Lru {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self {
            list: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<ObjCore>>> {
        self.list
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Objects currently on the list.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when the list is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Adds an object at the hot end; an approximate timestamp is fine.
    pub fn add(&self, oc: &Arc<ObjCore>, now: f64) {
        oc.set_last_lru(now);
        self.lock().push_back(Arc::clone(oc));
    }

    /// Removes an object, if present.
    pub fn remove(&self, oc: &Arc<ObjCore>) {
        self.lock().retain(|c| !Arc::ptr_eq(c, oc));
    }

    /// Signals recent use. Rate limited: touches within `lru_interval`
    /// of the previous one are ignored so hot objects do not thrash the
    /// list lock.
    pub fn touch(&self, oc: &Arc<ObjCore>, now: f64) {
        let last = oc.last_lru();
        if last.is_nan() {
            return;
        }
        if now - last < Config::get().params.lru_interval {
            return;
        }
        let mut list = self.lock();
        if let Some(pos) = list.iter().position(|c| Arc::ptr_eq(c, oc)) {
            if let Some(c) = list.remove(pos) {
                list.push_back(c);
            }
            oc.set_last_lru(now);
        }
    }

    /// Evicts the coldest idle object, freeing its storage, so the
    /// caller can retry an allocation. Returns false when nothing was
    /// nukable.
    pub fn nuke_one(&self, wrk: &mut Worker) -> bool {
        let victim = {
            let mut list = self.lock();
            let mut found = None;
            for (i, oc) in list.iter().enumerate() {
                if oc.has_flag(oc_flags::BUSY) {
                    continue;
                }
                // Nukable only when the cache itself holds the last
                // references: the list entry plus our iteration borrow.
                if Arc::strong_count(oc) <= 2 {
                    found = Some(i);
                    break;
                }
            }
            found.and_then(|i| list.remove(i))
        };
        let Some(oc) = victim else {
            return false;
        };
        oc.kill();
        debug!(last_lru = oc.last_lru(), "nuking object for space");
        oc.free_obj(wrk);
        wrk.stats.n_lru_nuked += 1;
        true
    }
}
