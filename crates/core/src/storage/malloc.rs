//! Malloc stevedore: storage on the system allocator.
//!
//! The simplest real stevedore. An optional byte cap bounds the total
//! outstanding allocation; within the cap every chunk is a plain heap
//! allocation. Unlimited by default.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::common::error::{AllocError, StorageArgError};
use crate::obj::ObjCore;
use crate::stats::{StevedoreStats, Worker};
use crate::storage::chunk::Chunk;
use crate::storage::lru::Lru;
use crate::storage::{Stevedore, simple};

/// Parses a byte size with the usual suffixes (k, M, G, T).
pub(crate) fn parse_bytes(s: &str) -> Result<u64, StorageArgError> {
    let s = s.trim();
    let (num, mult) = match s.as_bytes().last() {
        Some(b'k' | b'K') => (&s[..s.len() - 1], 1u64 << 10),
        Some(b'm' | b'M') => (&s[..s.len() - 1], 1u64 << 20),
        Some(b'g' | b'G') => (&s[..s.len() - 1], 1u64 << 30),
        Some(b't' | b'T') => (&s[..s.len() - 1], 1u64 << 40),
        _ => (s, 1),
    };
    let v: f64 = num
        .trim()
        .parse()
        .map_err(|_| StorageArgError::Spec(format!("bad size {s:?}")))?;
    if v < 0.0 {
        return Err(StorageArgError::Spec(format!("negative size {s:?}")));
    }
    Ok((v * mult as f64) as u64)
}

/// Storage on the system allocator, with an optional byte cap.
pub struct MallocStevedore {
    ident: String,
    /// Byte cap; `u64::MAX` means unlimited.
    max: u64,
    alloc: Mutex<u64>,
    stats: StevedoreStats,
    lru: Arc<Lru>,
}

impl std::fmt::Debug for MallocStevedore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MallocStevedore")
            .field("ident", &self.ident)
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}

impl MallocStevedore {
    /// Creates an instance from `-s` arguments: an optional size cap.
    pub fn open(ident: &str, args: &[&str]) -> Result<Arc<Self>, StorageArgError> {
        if args.len() > 1 {
            return Err(StorageArgError::Spec("(malloc) too many arguments".into()));
        }
        let max = match args.first() {
            Some(a) if !a.is_empty() => {
                let u = parse_bytes(a)?;
                if u < 1024 * 1024 {
                    return Err(StorageArgError::Spec(format!(
                        "(malloc) size {a:?} too small, did you forget to specify M or G?"
                    )));
                }
                u
            }
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
            alloc: Mutex::new(0),
            stats,
            lru: Arc::new(Lru::new()),
        }
    }

    fn capped(&self) -> bool {
        self.max != u64::MAX
    }
}

impl Stevedore for MallocStevedore {
    fn name(&self) -> &'static str {
        "malloc"
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
        {
            let mut alloc = self
                .alloc
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if *alloc + size as u64 > self.max {
                let _ = self.stats.c_fail.fetch_add(1, Ordering::Relaxed);
                return Err(AllocError::Full);
            }
            *alloc += size as u64;
        }
        self.stats.alloc(size as u64, self.capped());
        Ok(Arc::new(Chunk::new_heap(size)))
    }

    fn sml_free(&self, chunk: Arc<Chunk>) {
        let sz = chunk.space() as u64;
        {
            let mut alloc = self
                .alloc
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *alloc -= sz;
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
