//! Umem stevedore: slab-class storage.
//!
//! A variant of the malloc stevedore that serves allocations out of
//! power-of-two size classes with small per-class free caches, the way a
//! slab allocator amortizes churn under a steady chunk-size workload.
//! Oversized requests fall through to the plain heap.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::common::error::{AllocError, StorageArgError};
use crate::obj::ObjCore;
use crate::stats::{StevedoreStats, Worker};
use crate::storage::chunk::Chunk;
use crate::storage::lru::Lru;
use crate::storage::malloc::parse_bytes;
use crate::storage::{Stevedore, simple};

/// Smallest slab class (4 KiB).
const MIN_CLASS_SHIFT: u32 = 12;
/// Largest slab class (1 MiB); bigger requests bypass the caches.
const MAX_CLASS_SHIFT: u32 = 20;
/// Cached free chunks retained per class.
const CLASS_CACHE: usize = 8;

struct Caches {
    alloc: u64,
    /// Free chunks per class, index 0 = `MIN_CLASS_SHIFT`.
    free: [Vec<Arc<Chunk>>; (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize],
}

/// Slab-class storage with an optional byte cap.
pub struct UmemStevedore {
    ident: String,
    max: u64,
    caches: Mutex<Caches>,
    stats: StevedoreStats,
    lru: Arc<Lru>,
}

impl std::fmt::Debug for UmemStevedore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UmemStevedore")
            .field("ident", &self.ident)
            .finish_non_exhaustive()
    }
}

fn class_of(size: usize) -> Option<usize> {
    let shift = size.next_power_of_two().trailing_zeros().max(MIN_CLASS_SHIFT);
    if shift > MAX_CLASS_SHIFT {
        None
    } else {
        Some((shift - MIN_CLASS_SHIFT) as usize)
    }
}

fn class_size(class: usize) -> usize {
    1usize << (MIN_CLASS_SHIFT + class as u32)
}

impl UmemStevedore {
    /// Creates an instance from `-s` arguments: an optional size cap.
    pub fn open(ident: &str, args: &[&str]) -> Result<Arc<Self>, StorageArgError> {
        if args.len() > 1 {
            return Err(StorageArgError::Spec("(umem) too many arguments".into()));
        }
        let max = match args.first() {
            Some(a) if !a.is_empty() => parse_bytes(a)?,
            _ => u64::MAX,
        };
        Ok(Arc::new(Self::with_cap(ident, max)))
    }

    /// Creates an instance with an explicit cap (`u64::MAX` = unlimited).
    pub fn with_cap(ident: &str, max: u64) -> Self {
        let stats = StevedoreStats::default();
        if max != u64::MAX {
            stats.g_space.store(max, Ordering::Relaxed);
        }
        Self {
            ident: ident.to_string(),
            max,
            caches: Mutex::new(Caches {
                alloc: 0,
                free: Default::default(),
            }),
            stats,
            lru: Arc::new(Lru::new()),
        }
    }

    fn capped(&self) -> bool {
        self.max != u64::MAX
    }
}

impl Stevedore for UmemStevedore {
    fn name(&self) -> &'static str {
        "umem"
    }

    fn ident(&self) -> &str {
        &self.ident
    }

    fn stats(&self) -> &StevedoreStats {
        &self.stats
    }

    fn lru(&self) -> Option<&Arc<Lru>> {
        Some(&self.lru)
    }

    fn sml_alloc(&self, size: usize) -> Result<Arc<Chunk>, AllocError> {
        let _ = self.stats.c_req.fetch_add(1, Ordering::Relaxed);
        let class = class_of(size);
        let real = class.map_or(size, class_size);
        let cached = {
            let mut caches = self
                .caches
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if caches.alloc + real as u64 > self.max {
                let _ = self.stats.c_fail.fetch_add(1, Ordering::Relaxed);
                return Err(AllocError::Full);
            }
            caches.alloc += real as u64;
            class.and_then(|c| caches.free[c].pop())
        };
        self.stats.alloc(real as u64, self.capped());
        match cached {
            Some(st) => {
                st.set_len(0);
                Ok(st)
            }
            None => Ok(Arc::new(Chunk::new_heap(real))),
        }
    }

    fn sml_free(&self, chunk: Arc<Chunk>) {
        let sz = chunk.space() as u64;
        {
            let mut caches = self
                .caches
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            caches.alloc -= sz;
            // Only whole-class chunks with an exclusive handle go back on
            // the cache; anything else returns to the heap.
            if let Some(c) = class_of(chunk.space()) {
                if class_size(c) == chunk.space()
                    && chunk.flags() == 0
                    && Arc::strong_count(&chunk) == 1
                    && caches.free[c].len() < CLASS_CACHE
                {
                    self.stats.free(sz, self.capped());
                    caches.free[c].push(chunk);
                    return;
                }
            }
        }
        self.stats.free(sz, self.capped());
        drop(chunk);
    }

    fn allocobj(
        &self,
        wrk: &mut Worker,
        this: &Arc<dyn Stevedore>,
        oc: &Arc<ObjCore>,
        wsl: usize,
    ) -> Result<(), AllocError> {
        simple::allocobj(wrk, this, oc, wsl)
    }
}
