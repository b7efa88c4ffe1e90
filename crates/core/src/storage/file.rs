//! File stevedore: storage on an mmap'd file.
//!
//! One file, mapped shared, carved into extents tracked on bucketed
//! free lists:
//! - Bucket `b < NBUCKET-1` holds free extents of exactly `b` pages.
//! - The last bucket holds everything larger.
//! - Each bucket is kept in file-offset order, and adjacent free extents
//!   merge on free, so steady-state fragmentation stays bounded.
//!
//! Initialization maps the file with a recursive halving fallback: if a
//! window fails to map, it is split in two and each half retried, down
//! to a minimum of [`MINPAGES`] pages.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::sync::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::info;

use crate::common::error::{AllocError, StorageArgError};
use crate::obj::ObjCore;
use crate::stats::{StevedoreStats, Worker};
use crate::storage::chunk::{Backing, Chunk};
use crate::storage::lru::Lru;
use crate::storage::malloc::parse_bytes;
use crate::storage::{Stevedore, simple};

/// Minimum usable mapping, in pages; startup fails below this.
pub const MINPAGES: u64 = 128;

/// Number of free-list buckets. The second-to-last bucket matches a
/// 128 KiB chunk at a 4 KiB page size.
pub const NBUCKET: usize = 128 / 4 + 1;

/// Page-cache advice applied to the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    /// No special access pattern.
    Normal,
    /// Random access (the default for cache bodies).
    Random,
    /// Sequential access.
    Sequential,
}

impl Advice {
    fn to_madvise(self) -> libc::c_int {
        match self {
            Advice::Normal => libc::MADV_NORMAL,
            Advice::Random => libc::MADV_RANDOM,
            Advice::Sequential => libc::MADV_SEQUENTIAL,
        }
    }
}

#[derive(Clone, Copy)]
struct Extent {
    ptr: *mut u8,
    size: u64,
    alloc: bool,
}

struct FileInner {
    /// Every extent, keyed by file offset.
    extents: BTreeMap<u64, Extent>,
    /// Free extents per bucket, offset-ordered.
    free: Vec<BTreeSet<u64>>,
}

/// Storage on a single mmap'd file.
pub struct FileStevedore {
    ident: String,
    stats: StevedoreStats,
    lru: Arc<Lru>,
    pagesize: u64,
    filesize: u64,
    inner: Mutex<FileInner>,
    /// Original mmap windows, unmapped on drop.
    windows: Vec<(*mut u8, usize)>,
    _file: File,
}

// SAFETY: the raw window pointers are only dereferenced through chunks
// whose bounds were validated at allocation time; the mapping lives as
// long as the stevedore.
unsafe impl Send for FileStevedore {}
unsafe impl Sync for FileStevedore {}

impl std::fmt::Debug for FileStevedore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStevedore")
            .field("ident", &self.ident)
            .field("filesize", &self.filesize)
            .finish_non_exhaustive()
    }
}

fn pagesize() -> u64 {
    // SAFETY: plain sysconf query.
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps > 0 { ps as u64 } else { 4096 }
}

impl FileStevedore {
    /// Creates an instance from `-s` arguments:
    /// `path[,size[,granularity[,advice]]]`.
    pub fn open(ident: &str, args: &[&str]) -> Result<Arc<Self>, StorageArgError> {
        if args.is_empty() || args[0].is_empty() {
            return Err(StorageArgError::Spec("(file) path is mandatory".into()));
        }
        if args.len() > 4 {
            return Err(StorageArgError::Spec("(file) too many arguments".into()));
        }
        let path = args[0];
        let size = match args.get(1) {
            Some(s) if !s.is_empty() => parse_bytes(s)?,
            _ => 100 * 1024 * 1024,
        };
        let granularity = match args.get(2) {
            Some(s) if !s.is_empty() => parse_bytes(s)?,
            _ => pagesize(),
        };
        let advice = match args.get(3) {
            Some(&"normal") => Advice::Normal,
            Some(&"sequential") => Advice::Sequential,
            Some(&"random") | None => Advice::Random,
            Some(other) => {
                return Err(StorageArgError::Spec(format!(
                    "(file) invalid advice {other:?}"
                )));
            }
        };
        Self::create(ident, std::path::Path::new(path), size, granularity, advice)
    }

    /// Opens (creating if needed) and maps the backing file.
    pub fn create(
        ident: &str,
        path: &std::path::Path,
        size: u64,
        granularity: u64,
        advice: Advice,
    ) -> Result<Arc<Self>, StorageArgError> {
        let ps = pagesize();
        let granularity = granularity.max(ps);
        let filesize = (size / granularity) * granularity;
        if filesize < MINPAGES * ps {
            return Err(StorageArgError::Init(format!(
                "-sfile too small, minimum size is {} KiB",
                MINPAGES * ps / 1024
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(filesize)?;

        let mut this = Self {
            ident: ident.to_string(),
            stats: StevedoreStats::default(),
            lru: Arc::new(Lru::new()),
            pagesize: ps,
            filesize,
            inner: Mutex::new(FileInner {
                extents: BTreeMap::new(),
                free: (0..NBUCKET).map(|_| BTreeSet::new()).collect(),
            }),
            windows: Vec::new(),
            _file: file,
        };

        let mut fail = 1u64 << 40;
        let mut sum = 0u64;
        this.open_window(filesize, 0, advice, &mut fail, &mut sum);
        if sum < MINPAGES * ps {
            return Err(StorageArgError::Init(format!(
                "-sfile could not map enough of {}",
                path.display()
            )));
        }
        info!(ident, mapped = sum, of = filesize, "file storage mapped");
        this.stats.g_space.store(sum, Ordering::Relaxed);
        Ok(Arc::new(this))
    }

    /// Maps `[off, off+sz)`; on failure, halves the window and retries
    /// each part. Gives up once windows get smaller than the smallest
    /// mapping that has already failed, or the minimum useful size.
    fn open_window(
        &mut self,
        sz: u64,
        off: u64,
        advice: Advice,
        fail: &mut u64,
        sum: &mut u64,
    ) {
        assert_eq!(sz % self.pagesize, 0);
        if *fail < self.pagesize * MINPAGES {
            return;
        }
        if sz > 0 && sz < *fail && sz <= isize::MAX as u64 {
            // SAFETY: fd and range are valid; MAP_SHARED keeps the file
            // as backing store.
            let p = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    sz as usize,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    self._file.as_raw_fd(),
                    off as libc::off_t,
                )
            };
            if p != libc::MAP_FAILED {
                // SAFETY: freshly mapped range.
                let _ = unsafe { libc::madvise(p, sz as usize, advice.to_madvise()) };
                *sum += sz;
                self.windows.push((p as *mut u8, sz as usize));
                self.new_extent(p as *mut u8, off, sz);
                return;
            }
        }
        if sz < *fail {
            *fail = sz;
        }
        let mut h = sz / 2;
        h -= h % self.pagesize;
        if h == 0 {
            return;
        }
        self.open_window(h, off, advice, fail, sum);
        self.open_window(sz - h, off + h, advice, fail, sum);
    }

    /// Registers a fresh window as one allocated extent, then frees it so
    /// the normal merge path files it.
    fn new_extent(&mut self, ptr: *mut u8, off: u64, size: u64) {
        {
            let mut inner = self.lock();
            let prev = inner.extents.insert(
                off,
                Extent {
                    ptr,
                    size,
                    alloc: true,
                },
            );
            assert!(prev.is_none());
        }
        let _ = self.stats.g_smf.fetch_add(1, Ordering::Relaxed);
        self.free_extent(off);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FileInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn bucket_of(&self, size: u64) -> usize {
        ((size / self.pagesize) as usize).min(NBUCKET - 1)
    }

    fn insfree(&self, inner: &mut FileInner, off: u64) {
        let e = inner.extents[&off];
        assert!(!e.alloc);
        let b = self.bucket_of(e.size);
        if b == NBUCKET - 1 {
            let _ = self.stats.g_smf_large.fetch_add(1, Ordering::Relaxed);
        } else {
            let _ = self.stats.g_smf_frag.fetch_add(1, Ordering::Relaxed);
        }
        let inserted = inner.free[b].insert(off);
        assert!(inserted);
    }

    fn remfree(&self, inner: &mut FileInner, off: u64) {
        let e = inner.extents[&off];
        assert!(!e.alloc);
        let b = self.bucket_of(e.size);
        if b == NBUCKET - 1 {
            let _ = self.stats.g_smf_large.fetch_sub(1, Ordering::Relaxed);
        } else {
            let _ = self.stats.g_smf_frag.fetch_sub(1, Ordering::Relaxed);
        }
        let removed = inner.free[b].remove(&off);
        assert!(removed);
    }

    /// Allocates `bytes` (a page multiple) from the first free extent
    /// large enough, splitting the surplus off the back.
    fn alloc_extent(&self, bytes: u64) -> Option<(u64, *mut u8)> {
        assert_eq!(bytes % self.pagesize, 0);
        let mut inner = self.lock();
        let want = self.bucket_of(bytes);

        let mut found = None;
        for b in want..NBUCKET - 1 {
            if let Some(&off) = inner.free[b].first() {
                found = Some(off);
                break;
            }
        }
        if found.is_none() {
            // The larger-than bucket is offset ordered; first fit.
            found = inner.free[NBUCKET - 1]
                .iter()
                .copied()
                .find(|off| inner.extents[off].size >= bytes);
        }
        let off = found?;
        let e = inner.extents[&off];
        assert!(e.size >= bytes);
        self.remfree(&mut inner, off);

        if e.size == bytes {
            if let Some(cur) = inner.extents.get_mut(&off) {
                cur.alloc = true;
            }
            return Some((off, e.ptr));
        }

        // Split from the front: the request takes the head of the
        // extent, the residual keeps its bucket position.
        let rest_off = off + bytes;
        let _ = inner.extents.insert(
            off,
            Extent {
                ptr: e.ptr,
                size: bytes,
                alloc: true,
            },
        );
        let prev = inner.extents.insert(
            rest_off,
            Extent {
                // SAFETY: in-bounds offset within the same window.
                ptr: unsafe { e.ptr.add(bytes as usize) },
                size: e.size - bytes,
                alloc: false,
            },
        );
        assert!(prev.is_none());
        let _ = self.stats.g_smf.fetch_add(1, Ordering::Relaxed);
        self.insfree(&mut inner, rest_off);
        Some((off, e.ptr))
    }

    /// Frees an extent, merging with free neighbors that are contiguous
    /// both in file offset and in mapped address.
    fn free_extent(&self, off: u64) {
        let mut inner = self.lock();
        let mut e = inner.extents[&off];
        assert!(e.alloc);
        assert!(e.size > 0);
        assert_eq!(e.size % self.pagesize, 0);
        e.alloc = false;
        let mut off = off;

        // Merge forward.
        let next_off = off + e.size;
        if let Some(&n) = inner.extents.get(&next_off) {
            // SAFETY: pointer arithmetic only for the contiguity compare.
            if !n.alloc && std::ptr::eq(n.ptr, unsafe { e.ptr.add(e.size as usize) }) {
                self.remfree(&mut inner, next_off);
                let _ = inner.extents.remove(&next_off);
                let _ = self.stats.g_smf.fetch_sub(1, Ordering::Relaxed);
                e.size += n.size;
            }
        }

        // Merge backward.
        let prev = inner
            .extents
            .range(..off)
            .next_back()
            .map(|(&o, &p)| (o, p));
        if let Some((poff, p)) = prev {
            // SAFETY: as above.
            if !p.alloc
                && poff + p.size == off
                && std::ptr::eq(e.ptr, unsafe { p.ptr.add(p.size as usize) })
            {
                self.remfree(&mut inner, poff);
                let _ = inner.extents.remove(&off);
                let _ = self.stats.g_smf.fetch_sub(1, Ordering::Relaxed);
                e = Extent {
                    ptr: p.ptr,
                    size: p.size + e.size,
                    alloc: false,
                };
                off = poff;
            }
        }

        let _ = inner.extents.insert(off, e);
        self.insfree(&mut inner, off);
    }

    /// Testing/introspection: free-list shape as (bucket, offset, size).
    pub fn free_list(&self) -> Vec<(usize, u64, u64)> {
        let inner = self.lock();
        let mut out = Vec::new();
        for (b, set) in inner.free.iter().enumerate() {
            for &off in set {
                out.push((b, off, inner.extents[&off].size));
            }
        }
        out
    }

    /// The system page size this instance rounds to.
    pub fn page_size(&self) -> u64 {
        self.pagesize
    }
}

impl Drop for FileStevedore {
    fn drop(&mut self) {
        for &(ptr, sz) in &self.windows {
            // SAFETY: windows were mapped by open_window and never
            // partially unmapped.
            unsafe {
                let _ = libc::munmap(ptr as *mut libc::c_void, sz);
            }
        }
    }
}

impl Stevedore for FileStevedore {
    fn name(&self) -> &'static str {
        "file"
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
        assert!(size > 0);
        let bytes = (size as u64).next_multiple_of(self.pagesize);
        let Some((off, ptr)) = self.alloc_extent(bytes) else {
            let _ = self.stats.c_fail.fetch_add(1, Ordering::Relaxed);
            return Err(AllocError::Full);
        };
        self.stats.alloc(bytes, true);
        // SAFETY: the extent [ptr, ptr+bytes) was exclusively allocated
        // above and stays mapped for the stevedore's lifetime.
        let chunk = unsafe {
            Chunk::from_raw(ptr, bytes as usize, Backing::Mapped { offset: off })
        };
        Ok(Arc::new(chunk))
    }

    fn sml_free(&self, chunk: Arc<Chunk>) {
        let Backing::Mapped { offset } = *chunk.backing() else {
            panic!("foreign chunk freed to file storage");
        };
        let sz = chunk.space() as u64;
        drop(chunk);
        self.stats.free(sz, true);
        self.free_extent(offset);
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
