//! Persistent silo stevedore.
//!
//! A silo is one file holding a crash-recoverable object cache:
//! 1. **Metadata:** An identification block, a double-buffered ban
//!    journal and a double-buffered segment table, each protected by a
//!    SHA-256 signed block ([`sign`]).
//! 2. **Segments:** A ring of rolling segments inside the payload region;
//!    bodies grow up from the bottom of the current segment while object
//!    index records grow down from the top ([`segment`], [`layout`]).
//! 3. **Recovery:** On open, the surviving segment table is chosen (the
//!    good slot repairs the bad one), the free reserve is re-established
//!    by dropping leading segments, and surviving objects are resurrected
//!    lazily by the silo thread without touching their bodies.

/// On-disk record formats and raw accessors.
pub mod layout;
/// In-memory segment bookkeeping and cleaner metrics.
pub mod segment;
/// SHA-256 signed blocks.
pub mod sign;

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, Weak};

use tracing::{debug, info, warn};

use crate::common::error::{AllocError, SiloError, StorageArgError};
use crate::common::rand::XorShift64;
use crate::common::time;
use crate::obj::attr::oc_flags;
use crate::obj::event::{ObjEvents, oev};
use crate::obj::{Expiry, ObjCore};
use crate::stats::{StevedoreStats, Worker};
use crate::storage::chunk::{Backing, Chunk};
use crate::storage::lru::Lru;
use crate::storage::malloc::parse_bytes;
use crate::storage::simple::{DiskHeadPtr, SmlBody, SmlObject};
use crate::storage::{BanInfo, StorePriv, Stevedore};

use self::layout::{
    DISK_CHUNK_MAGIC, DISK_CHUNK_SIZE, DISK_OBJHEAD_SIZE, IDENT_SIZE, SEGPTR_SIZE,
    SIGN_SPACE, SMP_OBJECT_SIZE, SegPtr, SiloIdent, SmpObject, STUFF_BAN1,
    STUFF_BAN2, STUFF_END, STUFF_SEG1, STUFF_SEG2, STUFF_SPC,
};
use self::segment::{Metrics, SegHandle, SmpSeg};
use self::sign::{SignCtx, SignSpace};

/// Marks an object index word as still needing fix-up after resurrection.
pub const NEED_FIXUP: u32 = 1 << 31;

/// Housekeeping wakeup period, seconds.
const HOUSEKEEPING_PERIOD: f64 = std::f64::consts::PI - 2.0;

/// Per-object silo state: the owning segment and the index slot.
pub struct SiloObj {
    seg: SegHandle,
    /// Index word; the top bit is [`NEED_FIXUP`].
    idx: AtomicU32,
    /// Reconstructed simple-storage view, filled on first body access.
    sml: OnceLock<Arc<SmlObject>>,
}

impl std::fmt::Debug for SiloObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiloObj")
            .field("idx", &self.idx.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

struct SiloState {
    segments: VecDeque<SegHandle>,
    cur: Option<SegHandle>,
    next_bot: u64,
    next_top: u64,
    free_offset: u64,
    ban1: SignSpace,
    ban2: SignSpace,
    seg1: SignSpace,
    seg2: SignSpace,
}

/// One persistent silo, mapped to one file.
pub struct Silo {
    base: *mut u8,
    mediasize: u64,
    granularity: u64,
    align: u64,
    unique: u32,
    filename: PathBuf,
    file: File,
    stuff: [u64; 6],
    metrics: Metrics,
    state: Mutex<SiloState>,
    cond: Condvar,
    stop: AtomicBool,
    loaded: AtomicBool,
    lru: Arc<Lru>,
    stats: StevedoreStats,
    /// Objects resurrected from disk, standing in for the cache index.
    resurrected: Mutex<Vec<Arc<ObjCore>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

// SAFETY: the mapping lives for the silo's lifetime; all metadata
// mutation is serialized by the state mutex.
unsafe impl Send for Silo {}
unsafe impl Sync for Silo {}

impl std::fmt::Debug for Silo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Silo")
            .field("file", &self.filename)
            .field("mediasize", &self.mediasize)
            .finish_non_exhaustive()
    }
}

fn pagesize() -> u64 {
    // SAFETY: plain sysconf query.
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps > 0 { ps as u64 } else { 4096 }
}

impl Silo {
    /// Rounds up to the silo's record alignment.
    fn rnup(&self, v: u64) -> u64 {
        v.next_multiple_of(self.align)
    }

    /// Rounds down to the silo's record alignment.
    fn rndn(&self, v: u64) -> u64 {
        v - v % self.align
    }

    fn at(&self, off: u64) -> *mut u8 {
        assert!(off < self.mediasize);
        // SAFETY: in-bounds offset within the mapping.
        unsafe { self.base.add(off as usize) }
    }

    fn lock(&self) -> MutexGuard<'_, SiloState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Opens (or creates) the silo file and recovers its metadata. The
    /// housekeeping thread is not started yet.
    pub fn open(path: &Path, size: u64) -> Result<Silo, SiloError> {
        let granularity = pagesize();
        let mediasize = (size / granularity) * granularity;
        // Ident + two ban slots + two table slots + room for payload.
        if mediasize < granularity + 5 * (1 << 20) {
            return Err(SiloError::TooSmall(mediasize));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(mediasize)?;

        // SAFETY: mapping the whole file shared; fd stays open in self.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mediasize as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SiloError::Mmap(std::io::Error::last_os_error()));
        }
        let base = base as *mut u8;

        // The ident signature always carries unique 0; the silo's random
        // unique only guards the inner blocks.
        // SAFETY: offset 0 region is within the mapping.
        let mut idn =
            unsafe { SignCtx::define(base, 0, "SILO", granularity - SIGN_SPACE) };
        let align = (2 * size_of::<*const u8>()) as u64;

        let ident = match idn.check().map_err(|_| ()).and_then(|()| {
            layout::read_ident(idn.data(), mediasize).map_err(|_| ())
        }) {
            Ok(id) => id,
            Err(()) => {
                info!(file = %path.display(), "silo not reloadable, creating fresh");
                Self::format(base, mediasize, granularity as u32, align as u32, &mut idn)
            }
        };

        let stuff = ident.stuff;
        assert!(stuff[STUFF_BAN1] >= granularity);
        assert_eq!(
            stuff[STUFF_BAN2] - stuff[STUFF_BAN1],
            stuff[STUFF_SEG1] - stuff[STUFF_BAN2]
        );
        assert_eq!(
            stuff[STUFF_SEG2] - stuff[STUFF_SEG1],
            stuff[STUFF_SPC] - stuff[STUFF_SEG2]
        );
        assert_eq!(stuff[STUFF_END], mediasize);

        let ban_len = stuff[STUFF_BAN2] - stuff[STUFF_BAN1];
        let seg_len = stuff[STUFF_SEG2] - stuff[STUFF_SEG1];
        // SAFETY: each region is inside the mapping per the stuff table.
        let (ban1, ban2, seg1, seg2) = unsafe {
            (
                SignSpace::define(
                    base.add(stuff[STUFF_BAN1] as usize),
                    ban_len,
                    ident.unique,
                    "BAN 1",
                ),
                SignSpace::define(
                    base.add(stuff[STUFF_BAN2] as usize),
                    ban_len,
                    ident.unique,
                    "BAN 2",
                ),
                SignSpace::define(
                    base.add(stuff[STUFF_SEG1] as usize),
                    seg_len,
                    ident.unique,
                    "SEG 1",
                ),
                SignSpace::define(
                    base.add(stuff[STUFF_SEG2] as usize),
                    seg_len,
                    ident.unique,
                    "SEG 2",
                ),
            )
        };

        let spc_len = stuff[STUFF_END] - stuff[STUFF_SPC];
        let min_obj = (DISK_CHUNK_SIZE + DISK_OBJHEAD_SIZE + 4096) as u64;
        let metrics = Metrics::compute(spc_len, seg_len, min_obj);

        let silo = Silo {
            base,
            mediasize,
            granularity,
            align: ident.align as u64,
            unique: ident.unique,
            filename: path.to_path_buf(),
            file,
            stuff,
            metrics,
            state: Mutex::new(SiloState {
                segments: VecDeque::new(),
                cur: None,
                next_bot: 0,
                next_top: 0,
                free_offset: stuff[STUFF_SPC],
                ban1,
                ban2,
                seg1,
                seg2,
            }),
            cond: Condvar::new(),
            stop: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            lru: Arc::new(Lru::new()),
            stats: StevedoreStats::default(),
            resurrected: Mutex::new(Vec::new()),
            thread: Mutex::new(None),
        };
        silo.stats
            .g_space
            .store(spc_len, Ordering::Relaxed);

        silo.recover()?;
        Ok(silo)
    }

    /// Writes a fresh, valid, empty silo structure.
    fn format(
        base: *mut u8,
        mediasize: u64,
        granularity: u32,
        align: u32,
        idn: &mut SignCtx,
    ) -> SiloIdent {
        let unique = XorShift64::seeded().next_u64() as u32;
        let mb = 1u64 << 20;
        let ident = SiloIdent {
            unique,
            mediasize,
            granularity,
            align,
            stuff: [
                granularity as u64,
                granularity as u64 + mb,
                granularity as u64 + 2 * mb,
                granularity as u64 + 3 * mb,
                granularity as u64 + 4 * mb,
                mediasize,
            ],
        };
        assert!(ident.stuff[STUFF_SPC] < ident.stuff[STUFF_END]);

        for (i, id) in [
            (STUFF_BAN1, "BAN 1"),
            (STUFF_BAN2, "BAN 2"),
            (STUFF_SEG1, "SEG 1"),
            (STUFF_SEG2, "SEG 2"),
        ] {
            // SAFETY: region inside the mapping.
            let mut ctx = unsafe {
                SignCtx::define(
                    base.add(ident.stuff[i] as usize),
                    unique,
                    id,
                    mb - SIGN_SPACE,
                )
            };
            ctx.reset();
            ctx.sync();
        }

        idn.reset();
        let mut buf = vec![0u8; IDENT_SIZE];
        layout::write_ident(&mut buf, &ident);
        idn.append(&buf);
        idn.sync();
        ident
    }

    /// Recovery on open: repair the ban journal, pick a segment table
    /// slot, re-establish the free reserve, rewrite both slots.
    fn recover(&self) -> Result<(), SiloError> {
        let mut st = self.lock();

        // Ban journal: use the good copy, overwrite the bad one.
        let b1 = st.ban1.ctx.check();
        if b1.is_err() {
            st.ban2
                .ctx
                .check()
                .map_err(|_| SiloError::BothSlotsBad("ban"))?;
            let SiloState { ban1, ban2, .. } = &mut *st;
            ban1.copy_from(ban2);
            ban1.ctx.sync();
        } else {
            let SiloState { ban1, ban2, .. } = &mut *st;
            ban2.copy_from(ban1);
            ban2.ctx.sync();
        }

        // Segment table: slot 1 first, then slot 2.
        if self.open_segs(&mut st, true).is_err() {
            self.open_segs(&mut st, false)
                .map_err(|_| SiloError::BothSlotsBad("segment table"))?;
        }
        // Rewrite both slots so they agree again after a torn write.
        self.save_segs(&mut st);
        Ok(())
    }

    /// Parses one table slot and walks the ring to locate the free
    /// reserve, dropping leading segments as needed.
    fn open_segs(&self, st: &mut SiloState, slot1: bool) -> Result<(), ()> {
        let spc = if slot1 { &mut st.seg1 } else { &mut st.seg2 };
        spc.ctx.check().map_err(|_| ())?;
        let payload = spc.ctx.data().to_vec();
        assert_eq!(payload.len() % SEGPTR_SIZE, 0);
        let recs: Vec<SegPtr> = payload
            .chunks_exact(SEGPTR_SIZE)
            .map(SegPtr::read)
            .collect();

        st.segments.clear();
        if recs.is_empty() {
            st.free_offset = self.stuff[STUFF_SPC];
            return Ok(());
        }

        let se = recs.len() - 1;
        let mut ss = 0usize;
        let mut dropped = 0usize;

        st.free_offset = recs[se].offset + recs[se].length;
        let mut l = self.mediasize - st.free_offset;
        if recs[se].offset > recs[ss].offset && l >= self.metrics.free_reserve {
            // [__xxxxyyyyzzzz___] plenty of space at the tail.
        } else if recs[ss].offset > recs[se].offset {
            // [zzzz____xxxxyyyy_] wrapped; make space between the ends.
            while ss < se && recs[ss].offset > recs[se].offset {
                l = recs[ss].offset - (recs[se].offset + recs[se].length);
                if l > self.metrics.free_reserve {
                    break;
                }
                ss += 1;
                dropped += 1;
            }
        }
        if l < self.metrics.free_reserve {
            // [__xxxxyyyyzzzz___] make space at the front.
            st.free_offset = self.stuff[STUFF_SPC];
            while ss < se {
                l = recs[ss].offset - st.free_offset;
                if l > self.metrics.free_reserve {
                    break;
                }
                ss += 1;
                dropped += 1;
            }
        }
        assert!(l >= self.metrics.free_reserve);

        let mut prev_end: Option<(u64, u64)> = None;
        for rec in &recs[ss..=se] {
            assert!(rec.offset >= self.stuff[STUFF_SPC]);
            assert!(rec.offset + rec.length <= self.mediasize);
            if let Some((po, pe)) = prev_end {
                assert_ne!(po, rec.offset);
                if po < rec.offset {
                    assert!(pe <= rec.offset);
                }
            }
            prev_end = Some((rec.offset, rec.offset + rec.length));
            st.segments
                .push_back(Arc::new(Mutex::new(SmpSeg::recovered(*rec))));
        }
        if dropped > 0 {
            info!(dropped, "dropped segments to make the free reserve");
        }
        Ok(())
    }

    /// Serializes the segment list into both table slots, slot 1 first,
    /// each synced before the next is touched. Empty leading segments
    /// are pruned beforehand.
    fn save_segs(&self, st: &mut SiloState) {
        loop {
            let Some(front) = st.segments.front() else { break };
            let is_cur = st
                .cur
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, front));
            let sg = front
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if sg.nobj > 0 || is_cur {
                break;
            }
            assert!(sg.objcores.iter().all(|w| w.upgrade().is_none()));
            drop(sg);
            let _ = st.segments.pop_front();
        }

        let mut payload = Vec::with_capacity(st.segments.len() * SEGPTR_SIZE);
        for seg in &st.segments {
            let sg = seg
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            assert!(sg.p.offset < self.mediasize);
            assert!(sg.p.offset + sg.p.length <= self.mediasize);
            let mut buf = [0u8; SEGPTR_SIZE];
            sg.p.write(&mut buf);
            payload.extend_from_slice(&buf);
        }
        st.seg1.replace(&payload);
        st.seg2.replace(&payload);
    }

    /// Writable space left in the current segment, keeping room for the
    /// object index signature.
    fn spaceleft(&self, st: &SiloState) -> u64 {
        let reserve = st.next_bot + self.rnup(SIGN_SPACE);
        assert!(st.next_top >= reserve);
        st.next_top - reserve
    }

    /// Opens a new current segment at the free offset, wrapping to the
    /// start of the payload region when the tail is exhausted.
    fn new_seg(&self, st: &mut SiloState) {
        assert!(st.cur.is_none());
        let mut offset = st.free_offset;
        assert!(offset >= self.stuff[STUFF_SPC]);
        assert!(offset < self.mediasize);
        let length = self.rndn(self.metrics.aim_segl.max(self.metrics.min_segl));

        if offset + length > self.mediasize {
            offset = self.stuff[STUFF_SPC];
            info!("wrapped silo");
        }
        if let Some(first) = st.segments.front() {
            let fp = first
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .p;
            if offset <= fp.offset && offset + length > fp.offset {
                // No more space; cur stays empty until housekeeping
                // reclaims a segment.
                return;
            }
        }

        let p = SegPtr {
            offset: self.rnup(offset),
            length: self.rndn(length - (self.rnup(offset) - offset)),
            objlist: 0,
            lobjlist: 0,
        };
        st.free_offset = offset + length;

        let seg = Arc::new(Mutex::new(SmpSeg::new(p)));
        st.segments.push_back(Arc::clone(&seg));

        // Neuter whatever old segment head may be there.
        // SAFETY: p.offset is inside the payload region.
        let mut head =
            unsafe { SignCtx::define(self.at(p.offset), self.unique, "SEGHEAD", 0) };
        head.reset();
        head.sync();

        st.next_bot = p.offset + self.rnup(SIGN_SPACE);
        st.next_top = p.offset + p.length - self.rnup(SIGN_SPACE);
        {
            let mut sg = seg
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            sg.objs_off = st.next_top;
        }
        st.cur = Some(seg);
    }

    /// Closes the current segment: deletes it when empty, otherwise
    /// compacts the object index downwards when possible, writes the
    /// OBJIDX and SEGTAIL signatures and saves the table.
    fn close_seg(&self, st: &mut SiloState) {
        let Some(seg) = st.cur.take() else { return };
        let mut sg = seg
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        assert!(sg.p.offset != 0);

        if sg.nalloc == 0 {
            // Empty segment: delete instead.
            st.free_offset = sg.p.offset;
            let off = sg.p.offset;
            drop(sg);
            st.segments
                .retain(|s| !Arc::ptr_eq(s, &seg));
            debug!(offset = off, "deleted empty segment");
            self.save_segs(st);
            return;
        }

        let left = self.spaceleft(st);
        let len = (SMP_OBJECT_SIZE as u64) * u64::from(sg.p.lobjlist);
        if len < left {
            // Compact the index down against the body region.
            let dst = st.next_bot + self.rnup(SIGN_SPACE);
            assert!(dst + len < sg.objs_off);
            // SAFETY: both ranges are inside this segment; they do not
            // overlap per the assert above.
            unsafe {
                std::ptr::copy(
                    self.at(sg.objs_off),
                    self.at(dst),
                    len as usize,
                );
            }
            st.next_top = dst;
            sg.objs_off = dst;
            sg.p.length =
                (st.next_top - sg.p.offset) + len + self.rnup(SIGN_SPACE);
        }

        sg.p.objlist = st.next_top;

        st.next_top -= self.rnup(SIGN_SPACE);
        assert!(st.next_top >= st.next_bot);
        // SAFETY: both signature locations are inside the segment.
        unsafe {
            let mut objidx =
                SignCtx::define(self.at(st.next_top), self.unique, "OBJIDX", 0);
            objidx.reset();
            objidx.sync();
            let tail_off = sg.p.offset + sg.p.length - self.rnup(SIGN_SPACE);
            let mut tail =
                SignCtx::define(self.at(tail_off), self.unique, "SEGTAIL", 0);
            tail.reset();
            tail.sync();
        }

        st.free_offset = sg.end();
        drop(sg);
        self.save_segs(st);
    }

    /// Allocates `[min..max]` payload bytes from the bottom of the
    /// current segment, optionally with an object index slot from the
    /// top. Closes and reopens segments as needed.
    fn allocx(
        &self,
        min: usize,
        max: usize,
        want_obj: bool,
    ) -> Option<(Arc<Chunk>, Option<(SegHandle, u32)>)> {
        assert!(min <= max);
        let min = self.rnup(min as u64);
        let max = self.rnup(max as u64);
        let mut extra = self.rnup(DISK_CHUNK_SIZE as u64);
        if want_obj {
            extra += SMP_OBJECT_SIZE as u64;
        }

        let mut st = self.lock();
        let mut left = if st.cur.is_some() {
            self.spaceleft(&st)
        } else {
            0
        };
        if left < extra + min {
            self.close_seg(&mut st);
            self.new_seg(&mut st);
            left = if st.cur.is_some() {
                self.spaceleft(&st)
            } else {
                0
            };
        }
        if left < extra + min {
            return None;
        }

        let seg = st.cur.as_ref().map(Arc::clone)?;
        let mut size = max;
        if left < extra + max {
            size = self.rndn(left - extra);
        }
        assert!(size >= min);

        let hdr_off = st.next_bot;
        st.next_bot += self.rnup(DISK_CHUNK_SIZE as u64) + size;

        let objslot = if want_obj {
            st.next_top -= SMP_OBJECT_SIZE as u64;
            let slot_off = st.next_top;
            let mut sg = seg
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            sg.nalloc += 1;
            sg.objs_off = slot_off;
            sg.p.lobjlist += 1;
            let idx = sg.p.lobjlist;
            drop(sg);
            // Render the fresh record harmless.
            self.write_so(slot_off, &SmpObject::zero());
            Some((Arc::clone(&seg), idx))
        } else {
            let mut sg = seg
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            sg.nalloc += 1;
            None
        };
        let _ = self.spaceleft(&st); // for the assert
        drop(st);

        let hdr = self.at(hdr_off);
        // SAFETY: freshly reserved range within the segment.
        unsafe { layout::chunk_init(hdr, size) };
        let payload = self.at(hdr_off + self.rnup(DISK_CHUNK_SIZE as u64));
        // SAFETY: the payload range was exclusively reserved above and
        // the mapping outlives every chunk.
        let chunk = unsafe {
            Chunk::from_raw(
                payload,
                size as usize,
                Backing::Silo {
                    hdr,
                    off: hdr_off,
                },
            )
        };
        self.stats.alloc(size, true);
        Some((Arc::new(chunk), objslot))
    }

    fn write_so(&self, off: u64, so: &SmpObject) {
        // SAFETY: the slot is inside the object index region.
        let buf = unsafe {
            std::slice::from_raw_parts_mut(self.at(off), SMP_OBJECT_SIZE)
        };
        so.write(buf);
    }

    fn read_so(&self, off: u64) -> SmpObject {
        // SAFETY: as above, read-only.
        let buf =
            unsafe { std::slice::from_raw_parts(self.at(off), SMP_OBJECT_SIZE) };
        SmpObject::read(buf)
    }

    /// Offset of the object record for index word `idx` in `sg`.
    fn find_so(sg: &SmpSeg, idx: u32) -> u64 {
        let idx = idx & !NEED_FIXUP;
        assert!(idx > 0);
        assert!(idx <= sg.p.lobjlist);
        sg.objs_off + u64::from(sg.p.lobjlist - idx) * SMP_OBJECT_SIZE as u64
    }

    /// Encodes expiry for the on-disk record: absolute time, negated
    /// when the tail of the period is grace.
    fn encode_expiry(e: &Expiry) -> f64 {
        let when = e.when();
        if e.grace > 0.0 { -when } else { when }
    }

    // ------------------------------------------------------------------
    // Lazy load / fixup

    /// Loads one recovered segment: registers every unexpired object
    /// record as a resurrected objcore, without faulting in bodies.
    fn load_seg(self: &Arc<Self>, wrk: &mut Worker, stv: &Arc<dyn Stevedore>, seg: &SegHandle) {
        let p = {
            let mut sg = seg
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !sg.must_load {
                return;
            }
            sg.must_load = false;
            // Clear the bogus hold count from recovery.
            sg.nobj = 0;
            sg.p
        };
        if p.objlist == 0 {
            let mut sg = seg
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            sg.loaded = true;
            return;
        }
        // SAFETY: segment head is inside the payload region.
        let mut head =
            unsafe { SignCtx::define(self.at(p.offset), self.unique, "SEGHEAD", 0) };
        if head.check().is_err() {
            warn!(offset = p.offset, "segment head signature bad, not loading");
            return;
        }

        let t_now = time::real();
        let mut live = 0u32;
        for i in 0..p.lobjlist {
            let slot = p.objlist + u64::from(i) * SMP_OBJECT_SIZE as u64;
            let idx = p.lobjlist - i;
            let so = self.read_so(slot);
            if so.ptr == 0 || so.when() < t_now {
                continue;
            }
            let oc = ObjCore::new(wrk);
            oc.bind_store(
                Arc::clone(stv),
                StorePriv::Silo(Arc::new(SiloObj {
                    seg: Arc::clone(seg),
                    idx: AtomicU32::new(idx | NEED_FIXUP),
                    sml: OnceLock::new(),
                })),
            );
            oc.set_exp(Expiry {
                t_origin: so.when(),
                ttl: 0.0,
                grace: 0.0,
                keep: 0.0,
            });
            oc.set_ban_time(so.ban);
            oc.set_digest(so.hash);
            {
                let mut sg = seg
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                sg.nobj += 1;
                sg.objcores.push(Arc::downgrade(&oc));
            }
            live += 1;
            wrk.stats.n_vampireobject += 1;
            // Retire the (never used) boc; the object enters the LRU.
            oc.boc_done(wrk);
            self.resurrected
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(oc);
        }
        let mut sg = seg
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sg.loaded = true;
        debug!(offset = p.offset, live, "segment loaded");
    }

    /// Validates that a chunk record lies within a loaded segment.
    /// Returns a bad-bit mask, 0 when usable.
    fn loaded_chunk_check(&self, st: &SiloState, off: u64, hdr_only: bool) -> u32 {
        if off < self.stuff[STUFF_SPC] {
            return 0x01;
        }
        if off > self.stuff[STUFF_END] {
            return 0x02;
        }
        let mut claiming = None;
        for seg in &st.segments {
            let sg = seg
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if off > sg.p.offset && off + (DISK_CHUNK_SIZE as u64) < sg.p.objlist {
                claiming = Some((sg.p.objlist, sg.loaded));
                break;
            }
        }
        let Some((objlist, loaded)) = claiming else {
            return 0x04;
        };
        if !loaded {
            return 0x08;
        }
        // SAFETY: the header is inside a claimed, loaded segment.
        let (magic, len, space, _next) = unsafe { layout::chunk_read(self.at(off)) };
        if magic != DISK_CHUNK_MAGIC {
            return 0x10;
        }
        if !hdr_only && off + (DISK_CHUNK_SIZE as u64) + space >= objlist {
            return 0x20;
        }
        if len > space {
            return 0x40;
        }
        0
    }

    /// Rebuilds a chunk handle from its on-disk record.
    fn chunk_from_disk(&self, off: u64) -> (Arc<Chunk>, u64) {
        let hdr = self.at(off);
        // SAFETY: validated by loaded_chunk_check before the call.
        let (_magic, len, space, next) = unsafe { layout::chunk_read(hdr) };
        let payload = self.at(off + self.rnup(DISK_CHUNK_SIZE as u64));
        // SAFETY: the record was validated to lie within a loaded
        // segment; the mapping outlives the chunk.
        let chunk = unsafe {
            Chunk::from_raw(payload, space as usize, Backing::Silo { hdr, off })
        };
        chunk.set_len(len as usize);
        (Arc::new(chunk), next)
    }

    /// First body access of a resurrected object: rebuild the
    /// simple-storage view from the on-disk records and validate it.
    /// On any inconsistency the object is expired in place.
    fn fixup(
        self: &Arc<Self>,
        wrk: &mut Worker,
        oc: &ObjCore,
        so_priv: &SiloObj,
    ) -> Arc<SmlObject> {
        let st = self.lock();
        // Check again; we might have raced another fixup.
        if so_priv.idx.load(Ordering::Acquire) & NEED_FIXUP == 0 {
            drop(st);
            return Arc::clone(so_priv.sml.get().unwrap_or_else(|| {
                panic!("fixed-up object without a storage view")
            }));
        }

        let sg = so_priv
            .seg
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let slot = Self::find_so(&sg, so_priv.idx.load(Ordering::Acquire));
        let rec = self.read_so(slot);
        drop(sg);

        let mut bad = self.loaded_chunk_check(&st, rec.ptr, true);
        let mut body = SmlBody::default();
        let mut objstore = None;
        let mut total = 0u64;
        if bad == 0 {
            let (hdr_chunk, _) = self.chunk_from_disk(rec.ptr);
            let head_ptr = self.at(
                rec.ptr
                    + self.rnup(DISK_CHUNK_SIZE as u64),
            );
            // SAFETY: the header chunk payload starts with the object
            // head, written at allocation time.
            let (magic, va, esidata, body_head) =
                unsafe { layout::objhead_read(head_ptr) };
            if magic != layout::DISK_OBJHEAD_MAGIC {
                bad |= 0x80;
            } else {
                body.va_vary = (va[0].1 > 0).then_some(va[0]);
                body.va_headers = (va[1].1 > 0).then_some(va[1]);
                let mut off = body_head;
                while off != 0 && bad == 0 {
                    bad |= self.loaded_chunk_check(&st, off, false);
                    if bad != 0 {
                        break;
                    }
                    let (chunk, next) = self.chunk_from_disk(off);
                    total += chunk.len() as u64;
                    body.chunks.push_back(chunk);
                    off = next;
                }
                if bad == 0 && esidata != 0 {
                    bad |= self.loaded_chunk_check(&st, esidata, false);
                    if bad == 0 {
                        let (aux, _) = self.chunk_from_disk(esidata);
                        body.aux_esidata = Some(aux);
                    }
                }
            }
            objstore = Some((hdr_chunk, head_ptr));
        }

        if bad == 0 {
            // The chunk chain must account for exactly the stored length.
            if let Some((hdr_chunk, _)) = objstore.as_ref() {
                // SAFETY: fixed attribute area behind the object head.
                let buf = unsafe { hdr_chunk.slice(DISK_OBJHEAD_SIZE, 8) };
                if total != crate::common::encode::be64dec(buf) {
                    bad |= 0x100;
                }
            }
        }

        let o = match (bad, objstore) {
            (0, Some((hdr_chunk, head_ptr))) => SmlObject::from_parts(
                hdr_chunk,
                DISK_OBJHEAD_SIZE,
                Some(DiskHeadPtr(head_ptr)),
                body,
            ),
            (code, stored) => {
                warn!(bad = code, "resurrected object failed validation, expiring");
                oc.set_exp(Expiry::default());
                let mut dead = rec;
                dead.expiry = 0.0;
                self.write_so(slot, &dead);
                match stored {
                    Some((hdr_chunk, head_ptr)) => SmlObject::from_parts(
                        hdr_chunk,
                        DISK_OBJHEAD_SIZE,
                        Some(DiskHeadPtr(head_ptr)),
                        SmlBody::default(),
                    ),
                    None => {
                        // Not even the header chunk is usable; hand out a
                        // transient empty view so delivery fails cleanly.
                        SmlObject::new(Arc::new(Chunk::new_heap(
                            DISK_OBJHEAD_SIZE + crate::obj::attr::FIXED_ATTR_AREA,
                        )), 0, None)
                    }
                }
            }
        };

        let _ = so_priv.sml.set(Arc::clone(&o));
        {
            let mut sg = so_priv
                .seg
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            sg.nfixed += 1;
        }
        wrk.stats.n_object += 1;
        wrk.stats.n_vampireobject -= 1;
        let _ = so_priv
            .idx
            .fetch_and(!NEED_FIXUP, Ordering::AcqRel);
        drop(st);
        o
    }

    // ------------------------------------------------------------------
    // Housekeeping thread

    fn thread_main(self: &Arc<Self>, stv: &Arc<dyn Stevedore>) {
        let mut wrk = Worker::new();

        let segs: Vec<SegHandle> = {
            let st = self.lock();
            st.segments.iter().map(Arc::clone).collect()
        };
        for seg in &segs {
            self.load_seg(&mut wrk, stv, seg);
        }
        self.loaded.store(true, Ordering::Release);
        info!(file = %self.filename.display(), "silo completely loaded");

        let mut st = self.lock();
        while !self.stop.load(Ordering::Acquire) {
            let reclaim = st.segments.front().is_some_and(|first| {
                let is_cur = st
                    .cur
                    .as_ref()
                    .is_some_and(|c| Arc::ptr_eq(c, first));
                !is_cur
                    && first
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .nobj
                        == 0
            });
            if reclaim {
                self.save_segs(&mut st);
            }
            let (g, _) = self
                .cond
                .wait_timeout(st, time::duration(HOUSEKEEPING_PERIOD))
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            st = g;
        }
        self.save_segs(&mut st);
    }

    /// True once the silo thread has finished loading every segment.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// The `stuff[]` region offsets (tooling and tests).
    pub fn layout_offsets(&self) -> [u64; 6] {
        self.stuff
    }

    /// Current ban journal payload (for an external ban reload).
    pub fn ban_bytes(&self) -> Vec<u8> {
        let st = self.lock();
        st.ban1.ctx.data().to_vec()
    }

    /// Objects resurrected from disk (standing in for the cache index).
    pub fn resurrected(&self) -> Vec<Arc<ObjCore>> {
        self.resurrected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Human-readable silo report (CLI `persistent ... dump`).
    pub fn report(&self) -> String {
        use std::fmt::Write as _;
        let st = self.lock();
        let mut out = String::new();
        let _ = writeln!(out, "Silo: {}", self.filename.display());
        for seg in &st.segments {
            let sg = seg
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let _ = writeln!(
                out,
                "  Seg: [0x{:x} ... +0x{:x}]",
                sg.p.offset, sg.p.length
            );
            let is_cur = st.cur.as_ref().is_some_and(|c| Arc::ptr_eq(c, seg));
            if is_cur {
                let _ = writeln!(
                    out,
                    "    Alloc: [0x{:x} ... 0x{:x}] = 0x{:x} free",
                    st.next_bot,
                    st.next_top,
                    st.next_top - st.next_bot
                );
            }
            let _ = writeln!(
                out,
                "    {} nobj, {} alloc, {} lobjlist, {} fixed",
                sg.nobj, sg.nalloc, sg.p.lobjlist, sg.nfixed
            );
        }
        out
    }

    /// Closes and reopens the current segment (CLI `persistent ... sync`).
    pub fn sync_current(&self) {
        let mut st = self.lock();
        self.close_seg(&mut st);
        self.new_seg(&mut st);
    }
}

impl Drop for Silo {
    fn drop(&mut self) {
        // SAFETY: the mapping was created in open with this size; no
        // chunks can outlive the silo (they hold it through the
        // stevedore arc).
        unsafe {
            let _ = libc::munmap(self.base as *mut libc::c_void, self.mediasize as usize);
        }
    }
}

// ---------------------------------------------------------------------
// The stevedore wrapper

/// The persistent stevedore: one silo instance.
pub struct SiloStevedore {
    ident: String,
    silo: Arc<Silo>,
}

impl std::fmt::Debug for SiloStevedore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiloStevedore")
            .field("ident", &self.ident)
            .field("silo", &self.silo)
            .finish()
    }
}

impl SiloStevedore {
    /// Creates an instance from `-s` arguments: `path,size`.
    pub fn open(ident: &str, args: &[&str]) -> Result<Arc<Self>, StorageArgError> {
        if args.len() != 2 {
            return Err(StorageArgError::Spec(
                "(persistent) wrong number of arguments, need path,size".into(),
            ));
        }
        let size = parse_bytes(args[1])?;
        Self::create(ident, Path::new(args[0]), size)
    }

    /// Opens the silo file and starts the silo thread.
    pub fn create(
        ident: &str,
        path: &Path,
        size: u64,
    ) -> Result<Arc<Self>, StorageArgError> {
        let silo = Arc::new(
            Silo::open(path, size)
                .map_err(|e| StorageArgError::Init(e.to_string()))?,
        );
        {
            let mut st = silo.lock();
            silo.new_seg(&mut st);
        }
        let this = Arc::new(Self {
            ident: ident.to_string(),
            silo: Arc::clone(&silo),
        });
        let stv: Arc<dyn Stevedore> = Arc::clone(&this) as Arc<dyn Stevedore>;

        // React to ban/ttl/insert changes on our objects by updating
        // their on-disk records.
        let ev_stv = Arc::downgrade(&this);
        let _ = ObjEvents::global().subscribe(
            oev::BANCHG | oev::TTLCHG | oev::INSERT,
            Box::new(move |_wrk, oc, ev| {
                let Some(me) = ev_stv.upgrade() else { return };
                me.object_event(oc, ev);
            }),
        );

        let tsilo = Arc::clone(&silo);
        let tstv = Arc::clone(&stv);
        let handle = std::thread::Builder::new()
            .name(format!("silo-{ident}"))
            .spawn(move || tsilo.thread_main(&tstv));
        match handle {
            Ok(h) => {
                *silo
                    .thread
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(h);
            }
            Err(e) => return Err(StorageArgError::Init(e.to_string())),
        }
        Ok(this)
    }

    /// The underlying silo, for CLI introspection.
    pub fn silo(&self) -> &Arc<Silo> {
        &self.silo
    }

    fn object_event(self: &Arc<Self>, oc: &Arc<ObjCore>, ev: u32) {
        let Some(stv) = oc.stevedore_opt() else { return };
        if !std::ptr::addr_eq(Arc::as_ptr(&stv), Arc::as_ptr(self)) {
            return;
        }
        let Some(StorePriv::Silo(so)) = oc.store_priv() else {
            return;
        };
        // Only the current segment races close_seg; take the silo lock
        // for it, update others lock-free.
        let st = self.silo.lock();
        let is_cur = st
            .cur
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, &so.seg));
        let sg = so
            .seg
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let slot = Silo::find_so(&sg, so.idx.load(Ordering::Acquire));
        drop(sg);
        if !is_cur {
            drop(st);
        }
        let mut rec = self.silo.read_so(slot);
        if ev & (oev::BANCHG | oev::INSERT) != 0 {
            rec.ban = oc.ban_time();
        }
        if ev & (oev::TTLCHG | oev::INSERT) != 0 {
            rec.expiry = Silo::encode_expiry(&oc.exp());
        }
        self.silo.write_so(slot, &rec);
    }
}

impl Stevedore for SiloStevedore {
    fn name(&self) -> &'static str {
        "persistent"
    }

    fn ident(&self) -> &str {
        &self.ident
    }

    fn stats(&self) -> &StevedoreStats {
        &self.silo.stats
    }

    fn lru(&self) -> Option<&Arc<Lru>> {
        Some(&self.silo.lru)
    }

    fn sml_alloc(&self, size: usize) -> Result<Arc<Chunk>, AllocError> {
        let _ = self
            .silo
            .stats
            .c_req
            .fetch_add(1, Ordering::Relaxed);
        match self.silo.allocx(size.min(4096), size, false) {
            Some((chunk, None)) => Ok(chunk),
            Some((_, Some(_))) => unreachable!("no object slot requested"),
            None => {
                let _ = self
                    .silo
                    .stats
                    .c_fail
                    .fetch_add(1, Ordering::Relaxed);
                Err(AllocError::Full)
            }
        }
    }

    fn sml_free(&self, chunk: Arc<Chunk>) {
        // Silo space is reclaimed per segment, not per chunk.
        drop(chunk);
    }

    fn sml_getobj(&self, wrk: &mut Worker, oc: &ObjCore) -> Option<Arc<SmlObject>> {
        let Some(StorePriv::Silo(so)) = oc.store_priv() else {
            return None;
        };
        if so.idx.load(Ordering::Acquire) & NEED_FIXUP == 0 {
            return so.sml.get().map(Arc::clone);
        }
        Some(self.silo.fixup(wrk, oc, &so))
    }

    fn allocobj(
        &self,
        wrk: &mut Worker,
        this: &Arc<dyn Stevedore>,
        oc: &Arc<ObjCore>,
        wsl: usize,
    ) -> Result<(), AllocError> {
        // Don't entertain already dead objects.
        if oc.has_flag(oc_flags::DYING) {
            return Err(AllocError::Full);
        }
        let exp = oc.exp();
        if exp.t_origin <= 0.0 || exp.ttl + exp.grace + exp.keep <= 0.0 {
            return Err(AllocError::Full);
        }

        let ltot = DISK_OBJHEAD_SIZE
            + crate::obj::attr::FIXED_ATTR_AREA
            + wsl.next_multiple_of(8);
        let (chunk, seg, idx) = loop {
            match self.silo.allocx(ltot, ltot, true) {
                Some((chunk, Some((seg, idx)))) if chunk.space() >= ltot => {
                    break (chunk, seg, idx);
                }
                _ => {
                    if !self.silo.lru.nuke_one(wrk) {
                        return Err(AllocError::Full);
                    }
                }
            }
        };

        let head_ptr = self.silo.at(match chunk.backing() {
            Backing::Silo { off, .. } => {
                off + self.silo.rnup(DISK_CHUNK_SIZE as u64)
            }
            _ => unreachable!("silo allocation without silo backing"),
        });
        // SAFETY: head_ptr addresses the freshly allocated chunk payload.
        unsafe { layout::objhead_init(head_ptr) };
        let o = SmlObject::new(chunk, DISK_OBJHEAD_SIZE, Some(DiskHeadPtr(head_ptr)));

        let so_priv = Arc::new(SiloObj {
            seg: Arc::clone(&seg),
            idx: AtomicU32::new(idx),
            sml: OnceLock::new(),
        });
        let _ = so_priv.sml.set(Arc::clone(&o));
        oc.bind_store(Arc::clone(this), StorePriv::Silo(Arc::clone(&so_priv)));

        {
            let _st = self.silo.lock();
            let mut sg = seg
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            sg.nfixed += 1;
            sg.nobj += 1;
            sg.objcores.push(Arc::downgrade(oc));
            let slot = Silo::find_so(&sg, idx);
            let hdr_off = match o.objstore().backing() {
                Backing::Silo { off, .. } => *off,
                _ => unreachable!(),
            };
            drop(sg);
            self.silo.write_so(
                slot,
                &SmpObject {
                    hash: oc.digest().unwrap_or([0; 32]),
                    expiry: Silo::encode_expiry(&oc.exp()),
                    ban: oc.ban_time(),
                    ptr: hdr_off,
                    len: ltot as u64,
                },
            );
        }
        wrk.stats.n_object += 1;
        Ok(())
    }

    fn objfree(&self, wrk: &mut Worker, oc: &Arc<ObjCore>) {
        let Some(StorePriv::Silo(so)) = oc.store_priv() else {
            panic!("foreign object freed to the silo");
        };
        {
            let _st = self.silo.lock();
            let mut sg = so
                .seg
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let idx = so.idx.load(Ordering::Acquire);
            let slot = Silo::find_so(&sg, idx);
            let mut rec = self.silo.read_so(slot);
            rec.expiry = 0.0;
            rec.ptr = 0;
            self.silo.write_so(slot, &rec);

            assert!(sg.nobj > 0);
            sg.nobj -= 1;
            if idx & NEED_FIXUP != 0 {
                wrk.stats.n_vampireobject -= 1;
            } else {
                assert!(sg.nfixed > 0);
                sg.nfixed -= 1;
                wrk.stats.n_object -= 1;
            }
            sg.objcores.retain(|w| {
                w.upgrade().is_none_or(|c| !Arc::ptr_eq(&c, oc))
            });
        }
        if oc.boc().is_none() {
            self.silo.lru.remove(oc);
        }
        self.silo
            .resurrected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|c| !Arc::ptr_eq(c, oc));
        oc.unbind_store();
    }

    fn objslim(&self, _wrk: &mut Worker, _oc: &ObjCore) {
        // Silo bodies are reclaimed with their segment, never slimmed.
    }

    fn objtrimstore(&self, _wrk: &mut Worker, _oc: &ObjCore) {
        // Over-allocation stays inside the segment until it is dropped.
    }

    fn baninfo(&self, event: BanInfo, ban: &[u8]) -> Result<(), AllocError> {
        if event != BanInfo::New {
            return Ok(());
        }
        let mut st = self.silo.lock();
        let r1 = st.ban1.append(ban);
        let r2 = st.ban2.append(ban);
        if r1.is_err() || r2.is_err() {
            return Err(AllocError::Full);
        }
        Ok(())
    }

    fn banexport(&self, bans: &[u8]) {
        let mut st = self.silo.lock();
        st.ban1.replace(bans);
        st.ban2.replace(bans);
    }

    fn close(&self, warn: bool) {
        if warn {
            {
                let mut st = self.silo.lock();
                self.silo.close_seg(&mut st);
                assert!(st.cur.is_none());
            }
            self.silo.stop.store(true, Ordering::Release);
            self.silo.cond.notify_all();
        } else {
            let handle = self
                .silo
                .thread
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            if let Some(h) = handle {
                let _ = h.join();
            }
        }
    }
}
