//! In-memory segment bookkeeping for the persistent silo.

use std::sync::{Arc, Mutex, Weak};

use crate::obj::ObjCore;

use super::layout::SegPtr;

/// A contiguous span of the silo holding object bodies (growing up from
/// the bottom) and their `smp_object` index records (growing down from
/// the top).
pub struct SmpSeg {
    /// The on-disk segment pointer.
    pub p: SegPtr,
    /// Live objects in the segment.
    pub nobj: u32,
    /// Allocations ever made in the segment.
    pub nalloc: u32,
    /// Objects fixed up after resurrection (or created fixed).
    pub nfixed: u32,
    /// Set by recovery; cleared once the load pass has run.
    pub must_load: bool,
    /// The load pass completed and bodies may be referenced.
    pub loaded: bool,
    /// Current base of the object record array (lowest slot address).
    pub objs_off: u64,
    /// In-memory objcores referencing this segment.
    pub objcores: Vec<Weak<ObjCore>>,
}

/// Shared handle to a segment. Lock order: silo state first, then the
/// segment.
pub type SegHandle = Arc<Mutex<SmpSeg>>;

impl std::fmt::Debug for SmpSeg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmpSeg")
            .field("offset", &self.p.offset)
            .field("length", &self.p.length)
            .field("nobj", &self.nobj)
            .field("nalloc", &self.nalloc)
            .field("nfixed", &self.nfixed)
            .finish_non_exhaustive()
    }
}

impl SmpSeg {
    /// Creates a fresh, empty segment at `p`.
    pub fn new(p: SegPtr) -> Self {
        Self {
            p,
            nobj: 0,
            nalloc: 0,
            nfixed: 0,
            must_load: false,
            loaded: true,
            objs_off: 0,
            objcores: Vec::new(),
        }
    }

    /// Creates a recovered segment that still needs its load pass.
    ///
    /// `nobj` starts at 1 so housekeeping cannot drop the segment before
    /// the load pass has counted its real population.
    pub fn recovered(p: SegPtr) -> Self {
        Self {
            p,
            nobj: 1,
            nalloc: p.lobjlist,
            nfixed: 0,
            must_load: true,
            loaded: false,
            objs_off: p.objlist,
            objcores: Vec::new(),
        }
    }

    /// One past the last byte of the segment.
    pub fn end(&self) -> u64 {
        self.p.offset + self.p.length
    }
}

/// Cleaner metrics derived from the silo geometry.
#[derive(Debug, Clone, Copy)]
pub struct Metrics {
    /// Lower bound on segments per silo (bounds data lost per clean).
    pub min_nseg: u64,
    /// Upper bound on segments, limited by the segment table size.
    pub max_nseg: u64,
    /// Aim point: geometric mean of the extremes.
    pub aim_nseg: u64,
    /// Smallest segment length considered.
    pub min_segl: u64,
    /// Largest segment length considered.
    pub max_segl: u64,
    /// Segment length matching `aim_nseg`.
    pub aim_segl: u64,
    /// Headroom maintained between the tail of used space and the head
    /// of the ring.
    pub free_reserve: u64,
}

impl Metrics {
    /// Derives the metrics from the payload region and segment table
    /// sizes.
    ///
    /// A segment should cover no more than 1% of the silo, so a forced
    /// clean never drops too much; the table size bounds the segment
    /// count from above.
    pub fn compute(spc_len: u64, table_len: u64, min_obj: u64) -> Self {
        let min_nseg = 10u64;
        let max_segl = spc_len / min_nseg;

        let mut max_nseg =
            (table_len / super::layout::SEGPTR_SIZE as u64).max(min_nseg);
        let mut min_segl = spc_len / max_nseg;
        while min_segl < min_obj && max_nseg > min_nseg {
            max_nseg /= 2;
            min_segl = spc_len / max_nseg;
        }

        let aim_nseg =
            (((min_nseg as f64).ln() + (max_nseg as f64).ln()) * 0.5).exp() as u64;
        let aim_nseg = aim_nseg.clamp(min_nseg, max_nseg);
        let aim_segl = spc_len / aim_nseg;

        Self {
            min_nseg,
            max_nseg,
            aim_nseg,
            min_segl,
            max_segl,
            aim_segl,
            free_reserve: aim_segl * 10,
        }
    }
}
