//! Asynchronous body iteration (VAI): leases, scarabs and notification.
//!
//! Storage delivers a body as a sequence of leased (pointer, length)
//! regions. The consumer fills a caller-provided vector (a *scarab*) via
//! the lease call, hands the bytes onward, and returns the lease tokens
//! through a *scaret*. Storage may only reclaim a region once its lease
//! comes back, which is what makes streaming "free behind" safe.
//!
//! Leases are opaque 64-bit tokens with the low three bits clear. The
//! sentinel [`LEASE_NORET`] marks a region whose lease need not be
//! returned (fragments of a chunk still being written).

use std::sync::{Condvar, Mutex};

use crate::common::error::VaiError;
use crate::stats::Worker;

/// Sentinel lease: the caller need not (and must not) return it.
pub const LEASE_NORET: u64 = 8;

/// Asserts the structural invariant of a lease token.
pub fn assert_lease(lease: u64) {
    assert_eq!(lease & 0x7, 0, "malformed lease token");
}

/// One leased io-vector.
#[derive(Debug, Clone, Copy)]
pub struct Viov {
    /// Start of the readable region.
    pub ptr: *const u8,
    /// Length of the region in bytes.
    pub len: usize,
    /// Lease token covering the region.
    pub lease: u64,
}

// SAFETY: a Viov only travels between the lease call and the consumer on
// the same delivery; validity is guaranteed by the outstanding lease.
unsafe impl Send for Viov {}

impl Viov {
    /// The region as a byte slice.
    ///
    /// # Safety
    ///
    /// Valid only while the lease is outstanding.
    pub unsafe fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: storage issued (ptr, len) under an outstanding lease.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// Flag on [`VScarab`]: the body ends with the entries already produced.
pub const VSCARAB_F_END: u32 = 1 << 0;

/// Caller-provided vector of leased io-vectors.
#[derive(Debug)]
pub struct VScarab {
    /// Scarab flags ([`VSCARAB_F_END`]).
    pub flags: u32,
    capacity: usize,
    /// Filled entries.
    pub s: Vec<Viov>,
}

impl VScarab {
    /// Creates an empty scarab able to hold `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            flags: 0,
            capacity,
            s: Vec::with_capacity(capacity),
        }
    }

    /// Entry capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries currently used.
    pub fn used(&self) -> usize {
        self.s.len()
    }

    /// True when no more entries fit.
    pub fn is_full(&self) -> bool {
        self.s.len() == self.capacity
    }

    /// Appends an entry; returns false when the scarab is full.
    pub fn push(&mut self, viov: Viov) -> bool {
        if self.is_full() {
            return false;
        }
        assert_lease(viov.lease);
        self.s.push(viov);
        true
    }

    /// Clears entries and flags for reuse.
    pub fn reset(&mut self) {
        self.flags = 0;
        self.s.clear();
    }
}

/// Caller-provided vector of lease tokens being returned.
#[derive(Debug)]
pub struct VScaret {
    capacity: usize,
    /// Tokens queued for return.
    pub leases: Vec<u64>,
}

impl VScaret {
    /// Creates an empty scaret able to hold `capacity` tokens.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            capacity,
            leases: Vec::with_capacity(capacity),
        }
    }

    /// Token capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens queued.
    pub fn used(&self) -> usize {
        self.leases.len()
    }

    /// True when no more tokens fit.
    pub fn is_full(&self) -> bool {
        self.leases.len() == self.capacity
    }

    /// Queues a token for return.
    pub fn add(&mut self, lease: u64) {
        assert!(!self.is_full(), "scaret overflow");
        self.leases.push(lease);
    }

    /// Clears the scaret for reuse.
    pub fn reset(&mut self) {
        self.leases.clear();
    }
}

/// Notification target fired when a lease call that returned
/// `Again`/`NoBufs` can make progress.
///
/// The callback executes on an arbitrary thread *with the BOC mutex
/// held*, so implementations must not block; the canonical one just sets
/// a flag and signals a condvar.
pub trait VaiNotify: Send + Sync {
    /// Signals that the lease or buffer call may be retried.
    fn notify(&self);
}

/// The canonical blocking notifier used by the synchronous iterator.
#[derive(Debug, Default)]
pub struct BlockingNotify {
    hasmore: Mutex<bool>,
    cond: Condvar,
}

impl BlockingNotify {
    /// Creates a notifier with no pending signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until a notification arrives, consuming it.
    pub fn wait(&self) {
        let mut more = self
            .hasmore
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while !*more {
            more = self
                .cond
                .wait(more)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        *more = false;
    }
}

impl VaiNotify for BlockingNotify {
    fn notify(&self) {
        let mut more = self
            .hasmore
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *more = true;
        self.cond.notify_one();
    }
}

/// An active asynchronous iteration over one object body.
///
/// Obtained from a stevedore's `vai_init`. All leases must be returned
/// before [`VaiHandle::finish`].
pub trait VaiHandle: Send {
    /// Fills `scarab` with as many leased regions as are available.
    ///
    /// Returns the number of entries added, or:
    /// - [`VaiError::Again`] — nothing available; a notification will fire.
    /// - [`VaiError::NoBufs`] — return leases before more are produced.
    /// - [`VaiError::Pipe`] — the fetch failed.
    fn lease(
        &mut self,
        wrk: &mut Worker,
        scarab: &mut VScarab,
    ) -> Result<usize, VaiError>;

    /// Allocates empty scratch buffers of the sizes requested in
    /// `scarab` (each entry's `len` is the requested size). Used by
    /// filters that transform data.
    fn buffer(
        &mut self,
        wrk: &mut Worker,
        scarab: &mut VScarab,
    ) -> Result<usize, VaiError>;

    /// Returns previously issued leases. Clears the scaret.
    fn return_leases(&mut self, wrk: &mut Worker, scaret: &mut VScaret);

    /// Terminates the iteration. All leases must have been returned.
    fn finish(&mut self, wrk: &mut Worker);
}
