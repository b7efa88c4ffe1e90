//! Statistics collection for the cache core.
//!
//! This module tracks operational counters across the subsystems. It
//! provides:
//! 1. **Worker counters:** Object and objcore population, resurrected
//!    ("vampire") objects, LRU evictions.
//! 2. **Stevedore counters:** Allocation traffic and occupancy per storage
//!    instance, shared across threads.
//! 3. **Backend counters:** Connection reuse, failures and health gating.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-thread worker context.
///
/// Carries the thread's statistics and the approximate timestamp of its
/// last activity, used for cheap LRU stamping.
#[derive(Debug, Default)]
pub struct Worker {
    /// Counters owned by this worker thread.
    pub stats: WorkerStats,
    /// Wall-clock time of the last recorded activity; NaN when unknown.
    pub lastused: f64,
}

impl Worker {
    /// Creates a fresh worker context.
    pub fn new() -> Self {
        Self {
            stats: WorkerStats::default(),
            lastused: f64::NAN,
        }
    }
}

/// Counters owned by one worker thread.
///
/// Signed: a worker may account the destruction of an object another
/// worker created, so per-worker values are deltas that only sum to
/// non-negative totals across all workers.
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Objcore records currently allocated by this worker.
    pub n_objectcore: i64,
    /// Full objects (with storage bound) accounted by this worker.
    pub n_object: i64,
    /// Resurrected persistent objects not yet fixed up.
    pub n_vampireobject: i64,
    /// Objects evicted by LRU nuking.
    pub n_lru_nuked: i64,
    /// Lost attribute/header writes due to space exhaustion.
    pub n_losthdr: i64,
}

/// Allocation counters for one stevedore instance.
///
/// Shared between worker threads; all updates are relaxed atomics since
/// the counters are advisory.
#[derive(Debug, Default)]
pub struct StevedoreStats {
    /// Allocation requests.
    pub c_req: AtomicU64,
    /// Allocation failures.
    pub c_fail: AtomicU64,
    /// Bytes allocated, cumulative.
    pub c_bytes: AtomicU64,
    /// Bytes freed, cumulative.
    pub c_freed: AtomicU64,
    /// Outstanding allocations.
    pub g_alloc: AtomicU64,
    /// Outstanding allocated bytes.
    pub g_bytes: AtomicU64,
    /// Bytes available before the cap (meaningless for uncapped stores).
    pub g_space: AtomicU64,
    /// File stevedore: extents tracked (free or allocated).
    pub g_smf: AtomicU64,
    /// File stevedore: free extents in the exact-size buckets.
    pub g_smf_frag: AtomicU64,
    /// File stevedore: free extents in the larger-than bucket.
    pub g_smf_large: AtomicU64,
}

impl StevedoreStats {
    /// Records a successful allocation of `sz` bytes.
    pub fn alloc(&self, sz: u64, capped: bool) {
        self.c_bytes.fetch_add(sz, Ordering::Relaxed);
        self.g_alloc.fetch_add(1, Ordering::Relaxed);
        self.g_bytes.fetch_add(sz, Ordering::Relaxed);
        if capped {
            self.g_space.fetch_sub(sz, Ordering::Relaxed);
        }
    }

    /// Records a free of `sz` bytes.
    pub fn free(&self, sz: u64, capped: bool) {
        self.c_freed.fetch_add(sz, Ordering::Relaxed);
        self.g_alloc.fetch_sub(1, Ordering::Relaxed);
        self.g_bytes.fetch_sub(sz, Ordering::Relaxed);
        if capped {
            self.g_space.fetch_add(sz, Ordering::Relaxed);
        }
    }

    /// Snapshot of (c_bytes, c_freed, g_alloc, g_bytes) for reporting.
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.c_bytes.load(Ordering::Relaxed),
            self.c_freed.load(Ordering::Relaxed),
            self.g_alloc.load(Ordering::Relaxed),
            self.g_bytes.load(Ordering::Relaxed),
        )
    }
}

/// Connection-level counters for the backend pool.
#[derive(Debug, Default)]
pub struct BackendStats {
    /// Connections opened.
    pub conn: AtomicU64,
    /// Connections reused from the pool.
    pub reuse: AtomicU64,
    /// Pooled connections discarded because the peer had closed.
    pub toolate: AtomicU64,
    /// Connections returned to the pool.
    pub recycle: AtomicU64,
    /// Connection attempts that failed.
    pub fail: AtomicU64,
    /// Requests refused because the backend was unhealthy.
    pub unhealthy: AtomicU64,
    /// Requests refused by the max-connections gate.
    pub busy: AtomicU64,
}

impl BackendStats {
    /// Bumps a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
