//! The object event bus.
//!
//! Storage backends (notably the persistent silo) need to hear about
//! changes to objects they hold: ban updates, TTL changes and insertions.
//! Subscribers register a mask and a callback; publishers send an event
//! mask and every overlapping subscriber is invoked.
//!
//! Subscription is not atomic: the union mask is updated after the
//! subscriber list, so a concurrent publish may briefly miss a new
//! subscriber. This is acceptable because subscribers are installed at
//! initialization time.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::obj::ObjCore;
use crate::stats::Worker;

/// Event bits.
pub mod oev {
    /// The object's ban timestamp changed.
    pub const BANCHG: u32 = 1 << 0;
    /// The object's expiry parameters changed.
    pub const TTLCHG: u32 = 1 << 1;
    /// The object was inserted into the cache index.
    pub const INSERT: u32 = 1 << 2;
    /// All defined event bits.
    pub const MASK: u32 = BANCHG | TTLCHG | INSERT;
}

/// Event callback. May run on any thread; invoked under the bus read
/// lock, so it must not subscribe or unsubscribe.
pub type ObjEventFn =
    dyn Fn(&mut Worker, &Arc<ObjCore>, u32) + Send + Sync + 'static;

struct OevEntry {
    handle: u64,
    mask: u32,
    func: Box<ObjEventFn>,
}

/// The process-wide event bus.
pub struct ObjEvents {
    list: RwLock<Vec<OevEntry>>,
    /// Union of all subscriber masks, read optimistically on publish.
    mask: AtomicU32,
    next_handle: AtomicU64,
}

impl std::fmt::Debug for ObjEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjEvents")
            .field("mask", &self.mask.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for ObjEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjEvents {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            list: RwLock::new(Vec::new()),
            mask: AtomicU32::new(0),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Returns the process-wide bus.
    pub fn global() -> &'static ObjEvents {
        static GLOBAL: std::sync::OnceLock<ObjEvents> = std::sync::OnceLock::new();
        GLOBAL.get_or_init(ObjEvents::new)
    }

    /// Registers a subscriber for the events in `mask`; returns a handle
    /// for [`ObjEvents::unsubscribe`].
    pub fn subscribe(
        &self,
        mask: u32,
        func: Box<ObjEventFn>,
    ) -> u64 {
        assert_eq!(mask & !oev::MASK, 0);
        assert_ne!(mask, 0);
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut list = self
            .list
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        list.push(OevEntry { handle, mask, func });
        let _ = self.mask.fetch_or(mask, Ordering::Release);
        handle
    }

    /// Removes a subscriber and recomputes the union mask.
    pub fn unsubscribe(&self, handle: u64) {
        let mut list = self
            .list
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = list.len();
        list.retain(|e| e.handle != handle);
        assert_eq!(list.len() + 1, before, "unknown event subscription");
        let newmask = list.iter().fold(0, |m, e| m | e.mask);
        assert_eq!(newmask & !oev::MASK, 0);
        self.mask.store(newmask, Ordering::Release);
    }

    /// Publishes an event for `oc`.
    ///
    /// The union mask is checked without locking first, so the common
    /// no-subscriber case costs one atomic load. Subscribers whose mask
    /// intersects the event are invoked in registration order.
    pub fn send(&self, wrk: &mut Worker, oc: &Arc<ObjCore>, event: u32) {
        assert_ne!(event & oev::MASK, 0);
        assert_eq!(event & !oev::MASK, 0);
        if event & self.mask.load(Ordering::Acquire) == 0 {
            return;
        }
        let list = self
            .list
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for e in list.iter() {
            if event & e.mask != 0 {
                (e.func)(wrk, oc, event);
            }
        }
    }
}
