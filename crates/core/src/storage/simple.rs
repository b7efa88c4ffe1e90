//! Simple-storage (SML) helpers shared by most stevedores.
//!
//! Every stevedore whose objects are "a header chunk plus a list of body
//! chunks" (malloc, file, umem, debug, persistent) shares this layer. It
//! provides:
//! 1. **Object layout:** Fixed attributes at reserved offsets in the
//!    header chunk, variable attributes appended behind them, auxiliary
//!    attributes in their own allocation.
//! 2. **Body building:** getspace / extend / trim with nuke-and-retry
//!    allocation and progressive halving.
//! 3. **Delivery:** The lease-based async iteration handles and the
//!    generic blocking iterator, including streaming "free behind" for
//!    transient objects.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::common::error::{AllocError, DeliverError, VaiError};
use crate::common::time;
use crate::config::Config;
use crate::obj::ObjCore;
use crate::obj::attr::{FIXED_ATTR_AREA, ObjAttr, oc_flags};
use crate::obj::boc::{Boc, BocPriv, BocState};
use crate::stats::Worker;
use crate::storage::chunk::{Backing, BodySpace, CHUNK_F_BUFFER, Chunk};
use crate::storage::persistent::layout as silo_layout;
use crate::storage::vai::{
    BlockingNotify, LEASE_NORET, VScarab, VScaret, VaiHandle, VaiNotify, Viov,
};
use crate::storage::{IterFlags, IterateItem, StorePriv, Stevedore};

/// A tail smaller than this is not worth re-copying at trim time.
const TRIM_THRESHOLD: usize = 512;

/// Pointer to an on-disk object head inside a silo mapping.
#[derive(Clone, Copy)]
pub struct DiskHeadPtr(pub(crate) *mut u8);

// SAFETY: points into a silo mapping that outlives the object.
unsafe impl Send for DiskHeadPtr {}
unsafe impl Sync for DiskHeadPtr {}

impl std::fmt::Debug for DiskHeadPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DiskHeadPtr")
    }
}

/// Body-side state of a simple-storage object.
#[derive(Debug, Default)]
pub struct SmlBody {
    /// Body chunks, oldest first; the back entry is the current fetch
    /// chunk.
    pub chunks: VecDeque<Arc<Chunk>>,
    /// (offset, length) of the VARY attribute within the header chunk.
    pub va_vary: Option<(u32, u32)>,
    /// (offset, length) of the HEADERS attribute within the header chunk.
    pub va_headers: Option<(u32, u32)>,
    /// Auxiliary ESI data allocation.
    pub aux_esidata: Option<Arc<Chunk>>,
}

/// A simple-storage object: header chunk + body chunk list.
pub struct SmlObject {
    objstore: Arc<Chunk>,
    /// Offset of the fixed attribute area within the header chunk
    /// (non-zero for silo objects, whose chunk starts with the on-disk
    /// object head).
    attr_base: usize,
    /// Write-through target for silo-resident objects.
    disk_head: Option<DiskHeadPtr>,
    body: Mutex<SmlBody>,
}

impl std::fmt::Debug for SmlObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmlObject")
            .field("hdr_used", &self.objstore.len())
            .field("hdr_space", &self.objstore.space())
            .finish_non_exhaustive()
    }
}

impl SmlObject {
    /// Creates a fresh object over a header chunk.
    pub fn new(
        objstore: Arc<Chunk>,
        attr_base: usize,
        disk_head: Option<DiskHeadPtr>,
    ) -> Arc<Self> {
        objstore.set_len(attr_base + FIXED_ATTR_AREA);
        Arc::new(Self {
            objstore,
            attr_base,
            disk_head,
            body: Mutex::new(SmlBody::default()),
        })
    }

    /// Reassembles an object from recovered parts (silo resurrection).
    pub fn from_parts(
        objstore: Arc<Chunk>,
        attr_base: usize,
        disk_head: Option<DiskHeadPtr>,
        body: SmlBody,
    ) -> Arc<Self> {
        Arc::new(Self {
            objstore,
            attr_base,
            disk_head,
            body: Mutex::new(body),
        })
    }

    /// The header chunk.
    pub fn objstore(&self) -> &Arc<Chunk> {
        &self.objstore
    }

    /// Locks the body state.
    pub(crate) fn body(&self) -> MutexGuard<'_, SmlBody> {
        self.body
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Total committed body length.
    pub fn body_len(&self) -> u64 {
        self.body().chunks.iter().map(|c| c.len() as u64).sum()
    }

    fn fixed_region(&self, a: ObjAttr) -> (usize, usize) {
        let off = match a.fixed_offset() {
            Some(o) => o,
            None => panic!("not a fixed attribute"),
        };
        let sz = a.fixed_size().unwrap_or(0);
        (self.attr_base + off, sz)
    }

    fn read_hdr(&self, off: usize, len: usize) -> Vec<u8> {
        // SAFETY: header bytes are written by the (single) fetch thread;
        // concurrent readers only see attribute slots that are
        // overwritten atomically at byte granularity, matching the C
        // contract for attribute access.
        unsafe { self.objstore.slice(off, len).to_vec() }
    }
}

// ---------------------------------------------------------------------
// Allocation helpers

/// Allocates from the stevedore with the progressive-halving fallback.
///
/// Without `less_ok`, oversized requests fail outright. With it, the
/// request is clamped to the max chunk size and halved on failure until
/// the configured chunk size is reached.
pub fn stv_alloc(
    stv: &Arc<dyn Stevedore>,
    size: usize,
    less_ok: bool,
) -> Result<Arc<Chunk>, AllocError> {
    let params = &Config::get().params;
    if !less_ok {
        if size > params.fetch_maxchunksize {
            return Err(AllocError::TooBig(size));
        }
        return stv.sml_alloc(size);
    }
    let mut size = size.min(params.fetch_maxchunksize);
    loop {
        assert!(size > 0);
        match stv.sml_alloc(size) {
            Ok(st) => return Ok(st),
            Err(e) => {
                if size <= params.fetch_chunksize {
                    return Err(e);
                }
                size /= 2;
            }
        }
    }
}

/// Allocation with LRU nuking: on failure, evict one object and retry
/// until either the allocation succeeds or nothing is nukable.
pub fn alloc_with_nuke(
    wrk: &mut Worker,
    stv: &Arc<dyn Stevedore>,
    size: usize,
    less_ok: bool,
) -> Result<Arc<Chunk>, AllocError> {
    let params = &Config::get().params;
    let size = if size > params.fetch_maxchunksize {
        if !less_ok {
            return Err(AllocError::TooBig(size));
        }
        params.fetch_maxchunksize
    } else {
        size
    };
    loop {
        match stv_alloc(stv, size, less_ok) {
            Ok(st) => return Ok(st),
            Err(e) => {
                let Some(lru) = stv.lru() else {
                    return Err(e);
                };
                let lru = Arc::clone(lru);
                if !lru.nuke_one(wrk) {
                    return Err(e);
                }
            }
        }
    }
}

/// The default allocobj for stevedores without persistence: one header
/// chunk with `wsl` bytes of variable-attribute reserve.
pub fn allocobj(
    wrk: &mut Worker,
    this: &Arc<dyn Stevedore>,
    oc: &Arc<ObjCore>,
    wsl: usize,
) -> Result<(), AllocError> {
    let ltot = FIXED_ATTR_AREA + wsl.next_multiple_of(8);
    let st = loop {
        match stv_alloc(this, ltot, false) {
            Ok(st) if st.space() >= ltot => break st,
            Ok(st) => this.sml_free(st),
            Err(_) => {}
        }
        let Some(lru) = this.lru() else {
            return Err(AllocError::Full);
        };
        let lru = Arc::clone(lru);
        if !lru.nuke_one(wrk) {
            return Err(AllocError::Full);
        }
    };
    let o = SmlObject::new(st, 0, None);
    oc.bind_store(Arc::clone(this), StorePriv::Sml(o));
    wrk.stats.n_object += 1;
    Ok(())
}

fn getobj(wrk: &mut Worker, oc: &ObjCore) -> Arc<SmlObject> {
    let stv = oc.stevedore();
    match stv.sml_getobj(wrk, oc) {
        Some(o) => o,
        None => panic!("objcore has no simple-storage object"),
    }
}

// ---------------------------------------------------------------------
// Object methods

/// Obtains writable space at the tail of the current body chunk,
/// allocating a new chunk when the tail is full.
pub fn getspace(
    wrk: &mut Worker,
    oc: &ObjCore,
    sz: usize,
) -> Result<BodySpace, AllocError> {
    let params = &Config::get().params;
    let boc = match oc.boc() {
        Some(b) => b,
        None => panic!("getspace on a stable object"),
    };
    let mut sz = if sz == 0 { params.fetch_chunksize } else { sz };
    let transit = boc.transit_buffer();
    if transit > 0 {
        sz = sz.min(transit as usize);
    }
    assert!(sz > 0);

    let o = getobj(wrk, oc);
    {
        let body = o.body();
        if let Some(st) = body.chunks.back() {
            if st.len() < st.space() {
                let (ptr, len) = st.region(st.len(), st.space() - st.len());
                return Ok(BodySpace::new(ptr as *mut u8, len));
            }
        }
    }

    let stv = oc.stevedore();
    let st = alloc_with_nuke(wrk, &stv, sz, true)?;
    let mut body = o.body();
    link_disk_chunk(&o, &body, &st);
    body.chunks.push_back(Arc::clone(&st));
    let (ptr, len) = st.region(0, st.space());
    Ok(BodySpace::new(ptr as *mut u8, len))
}

/// Writes the silo chain links for a freshly appended body chunk.
fn link_disk_chunk(o: &SmlObject, body: &SmlBody, st: &Chunk) {
    let Some(dh) = o.disk_head else { return };
    let Backing::Silo { off: new_off, .. } = *st.backing() else {
        return;
    };
    match body.chunks.back().map(|c| c.backing()) {
        Some(&Backing::Silo { hdr, .. }) => {
            // SAFETY: both headers live in the silo mapping.
            unsafe { silo_layout::chunk_set_next(hdr, new_off) };
        }
        _ => {
            // SAFETY: dh addresses the on-disk object head.
            unsafe { silo_layout::objhead_set_body_head(dh.0, new_off) };
        }
    }
    // SAFETY: as above.
    unsafe { silo_layout::objhead_set_body_tail(dh.0, new_off) };
}

/// Commits `l` bytes into the current body chunk.
pub fn extend(wrk: &mut Worker, oc: &ObjCore, l: usize) {
    assert!(l > 0);
    let o = getobj(wrk, oc);
    let body = o.body();
    let st = match body.chunks.back() {
        Some(st) => st,
        None => panic!("extend without a body chunk"),
    };
    assert!(st.len() + l <= st.space());
    st.add_len(l);
}

/// Releases over-allocation at the end of the fetch.
///
/// An empty trailing chunk is dropped outright; a tail wasting at least
/// 512 bytes is re-copied into a right-sized chunk. Either way the
/// replaced chunk is parked on the BOC and freed when it retires, since
/// deliverers may still hold leases on it.
pub fn trimstore(wrk: &mut Worker, oc: &ObjCore) {
    let boc = match oc.boc() {
        Some(b) => b,
        None => panic!("trim on a stable object"),
    };
    let stv = oc.stevedore();
    match boc.swap_priv(BocPriv::Trimmed) {
        BocPriv::Unset => {}
        _ => panic!("trimstore already called"),
    }

    let o = getobj(wrk, oc);
    let mut body = o.body();
    let Some(st) = body.chunks.back().map(Arc::clone) else {
        return;
    };

    if st.is_empty() {
        let _ = body.chunks.pop_back();
        let _ = boc.swap_priv(BocPriv::Leftover(st));
        return;
    }

    if st.space() - st.len() < TRIM_THRESHOLD {
        return;
    }

    let Ok(st1) = stv_alloc(&stv, st.len(), false) else {
        return;
    };
    assert!(st1.space() >= st.len());
    // SAFETY: bytes below st.len() are committed and stable.
    st1.write_at(0, unsafe { st.slice(0, st.len()) });
    st1.set_len(st.len());
    let _ = body.chunks.pop_back();
    link_disk_chunk(&o, &body, &st1);
    body.chunks.push_back(st1);
    let _ = boc.swap_priv(BocPriv::Leftover(st));
}

/// Frees whatever trim parked on the BOC.
fn bocfini(stv: &Arc<dyn Stevedore>, boc: &Boc) {
    if let BocPriv::Leftover(st) = boc.take_priv() {
        stv.sml_free(st);
    }
}

/// BOC retirement: free trim leftovers, enter the LRU.
pub fn bocdone(wrk: &mut Worker, oc: &Arc<ObjCore>, boc: &Arc<Boc>) {
    let stv = oc.stevedore();
    bocfini(&stv, boc);
    if let Some(lru) = stv.lru() {
        if wrk.lastused.is_nan() {
            wrk.lastused = time::real();
        }
        // An approximate timestamp is fine here.
        lru.add(oc, wrk.lastused);
    }
}

/// Releases body chunks and auxiliary attributes, keeping the header.
pub fn slim(wrk: &mut Worker, oc: &ObjCore) {
    let stv = oc.stevedore();
    let o = getobj(wrk, oc);
    let mut body = o.body();
    if let Some(aux) = body.aux_esidata.take() {
        stv.sml_free(aux);
    }
    while let Some(st) = body.chunks.pop_front() {
        stv.sml_free(st);
    }
}

/// Full teardown: slim, release the header chunk, detach from the LRU
/// and disassociate the stevedore.
pub fn objfree(wrk: &mut Worker, oc: &Arc<ObjCore>) {
    let stv = oc.stevedore();
    let o = getobj(wrk, oc);
    slim(wrk, oc);
    let st = Arc::clone(o.objstore());
    match oc.boc() {
        Some(boc) => bocfini(&stv, &boc),
        None => {
            if let Some(lru) = stv.lru() {
                lru.remove(oc);
            }
        }
    }
    stv.sml_free(st);
    oc.unbind_store();
    wrk.stats.n_object -= 1;
}

/// Reads an attribute out of the object layout.
pub fn getattr(wrk: &mut Worker, oc: &ObjCore, attr: ObjAttr) -> Option<Vec<u8>> {
    let o = getobj(wrk, oc);
    if attr.fixed_size().is_some() {
        let (off, sz) = o.fixed_region(attr);
        return Some(o.read_hdr(off, sz));
    }
    let body = o.body();
    match attr {
        ObjAttr::Vary => body
            .va_vary
            .map(|(off, len)| o.read_hdr(off as usize, len as usize)),
        ObjAttr::Headers => body
            .va_headers
            .map(|(off, len)| o.read_hdr(off as usize, len as usize)),
        ObjAttr::EsiData => body.aux_esidata.as_ref().map(|aux| {
            // SAFETY: aux attribute bytes are committed before readers
            // can observe the attribute.
            unsafe { aux.slice(0, aux.len()).to_vec() }
        }),
        _ => None,
    }
}

/// Writes an attribute into the object layout.
pub fn setattr(
    wrk: &mut Worker,
    oc: &ObjCore,
    attr: ObjAttr,
    data: &[u8],
) -> Result<(), AllocError> {
    let o = getobj(wrk, oc);
    if let Some(sz) = attr.fixed_size() {
        assert_eq!(data.len(), sz, "fixed attribute size mismatch");
        let (off, _) = o.fixed_region(attr);
        o.objstore.write_at(off, data);
        return Ok(());
    }
    if attr.is_variable() {
        let mut body = o.body();
        let slot = match attr {
            ObjAttr::Vary => &mut body.va_vary,
            _ => &mut body.va_headers,
        };
        if let Some((off, len)) = *slot {
            assert_eq!(
                data.len(),
                len as usize,
                "variable attribute re-set with different length"
            );
            o.objstore.write_at(off as usize, data);
            return Ok(());
        }
        if data.is_empty() {
            return Ok(());
        }
        let off = o.objstore.len();
        assert!(
            off + data.len() <= o.objstore.space(),
            "variable attribute exceeds the reserve"
        );
        o.objstore.write_at(off, data);
        o.objstore.add_len(data.len());
        *slot = Some((off as u32, data.len() as u32));
        if let Some(dh) = o.disk_head {
            let idx = usize::from(attr == ObjAttr::Headers);
            // SAFETY: dh addresses the on-disk object head.
            unsafe {
                silo_layout::objhead_set_va(dh.0, idx, off as u32, data.len() as u32);
            }
        }
        return Ok(());
    }

    // Auxiliary attribute.
    assert_eq!(attr, ObjAttr::EsiData);
    let stv = oc.stevedore();
    let mut body = o.body();
    if let Some(aux) = body.aux_esidata.as_ref() {
        assert_eq!(data.len(), aux.len(), "aux attribute re-set with different length");
        aux.write_at(0, data);
        return Ok(());
    }
    if data.is_empty() {
        return Ok(());
    }
    drop(body);
    let aux = alloc_with_nuke(wrk, &stv, data.len(), false)?;
    assert!(aux.space() >= data.len());
    aux.write_at(0, data);
    aux.set_len(data.len());
    let mut body = o.body();
    if let (Some(dh), Backing::Silo { off, .. }) = (o.disk_head, aux.backing()) {
        // SAFETY: dh addresses the on-disk object head.
        unsafe { silo_layout::objhead_set_esidata(dh.0, *off) };
    }
    body.aux_esidata = Some(aux);
    Ok(())
}

// ---------------------------------------------------------------------
// Async iteration handle

/// Lease token table: tokens are sequence numbers shifted to keep the
/// low bits clear.
struct LeaseTable {
    map: HashMap<u64, Arc<Chunk>>,
    seq: u64,
}

impl LeaseTable {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            seq: 1,
        }
    }

    fn issue(&mut self, st: &Arc<Chunk>) -> u64 {
        self.seq += 1;
        let token = self.seq << 3;
        let prev = self.map.insert(token, Arc::clone(st));
        assert!(prev.is_none());
        token
    }

    fn redeem(&mut self, token: u64) -> Option<Arc<Chunk>> {
        self.map.remove(&token)
    }
}

/// The simple-storage async iteration handle.
pub struct SmlHdl {
    oc: Arc<ObjCore>,
    obj: Arc<SmlObject>,
    stv: Arc<dyn Stevedore>,
    boc: Option<Arc<Boc>>,
    notify: Arc<dyn VaiNotify>,
    leases: LeaseTable,
    /// Streaming free-behind applies (transient object with a BOC).
    transient: bool,

    // Finished-body cursor.
    next_idx: usize,

    // Streaming cursor.
    cur: Option<Arc<Chunk>>,
    st_off: usize,
    avail: u64,
    returned: u64,
    /// Fully-emitted newest chunk held back until a successor exists.
    last: Option<Arc<Chunk>>,
}

impl std::fmt::Debug for SmlHdl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmlHdl")
            .field("returned", &self.returned)
            .field("avail", &self.avail)
            .finish_non_exhaustive()
    }
}

/// Starts an async iteration over a simple-storage object.
pub fn vai_init(
    wrk: &mut Worker,
    oc: &Arc<ObjCore>,
    notify: Arc<dyn VaiNotify>,
) -> Option<Box<dyn VaiHandle>> {
    let stv = oc.stevedore();
    let obj = stv.sml_getobj(wrk, oc)?;
    let boc = oc.boc();
    let transient = boc.is_some() && oc.has_flag(oc_flags::TRANSIENT);
    Some(Box::new(SmlHdl {
        oc: Arc::clone(oc),
        obj,
        stv,
        boc,
        notify,
        leases: LeaseTable::new(),
        transient,
        next_idx: 0,
        cur: None,
        st_off: 0,
        avail: 0,
        returned: 0,
        last: None,
    }))
}

impl SmlHdl {
    fn chunk_after(body: &SmlBody, st: &Arc<Chunk>) -> Option<Arc<Chunk>> {
        let pos = body.chunks.iter().position(|c| Arc::ptr_eq(c, st))?;
        body.chunks.get(pos + 1).map(Arc::clone)
    }

    /// Lease entries from a finished (stable) body.
    fn lease_simple(&mut self, scarab: &mut VScarab) -> Result<usize, VaiError> {
        let body = self.obj.body();
        let mut r = 0;
        while self.next_idx < body.chunks.len() {
            if scarab.is_full() {
                return Ok(r);
            }
            let st = &body.chunks[self.next_idx];
            let (ptr, len) = st.region(0, st.len());
            let lease = self.leases.issue(st);
            let ok = scarab.push(Viov { ptr, len, lease });
            assert!(ok);
            r += 1;
            self.next_idx += 1;
        }
        scarab.flags |= crate::storage::vai::VSCARAB_F_END;
        Ok(r)
    }

    /// Lease entries from a body still being fetched.
    ///
    /// Fragments of the chunk under construction carry [`LEASE_NORET`];
    /// the real lease for a chunk is issued once the chunk is sealed, so
    /// "free behind" only ever releases completed chunks.
    fn lease_boc(&mut self, scarab: &mut VScarab) -> Result<usize, VaiError> {
        let boc = match self.boc.as_ref() {
            Some(b) => Arc::clone(b),
            None => panic!("streaming lease without a boc"),
        };
        let mut state = BocState::Invalid;
        if self.avail == self.returned {
            let (avail, st) = boc.vai_get_extend(self.returned, &self.notify);
            self.avail = avail;
            state = st;
            if state == BocState::Failed {
                self.last = None;
                return Err(VaiError::Pipe);
            }
            if state < BocState::Finished && self.avail == self.returned {
                // A notification has been scheduled.
                return if boc.transit_buffer() > 0 {
                    Err(VaiError::NoBufs)
                } else {
                    Err(VaiError::Again)
                };
            }
        }

        let mut r = 0;
        {
            let body = self.obj.body();
            if self.cur.is_none() {
                if let Some(last) = self.last.as_ref() {
                    self.cur = Self::chunk_after(&body, last);
                }
            }
            if let Some(last) = self.last.take() {
                if state < BocState::Finished {
                    // Null entry whose only purpose is to hand over the
                    // held-back resume lease.
                    let lease = self.leases.issue(&last);
                    let ok = scarab.push(Viov {
                        ptr: std::ptr::null(),
                        len: 0,
                        lease,
                    });
                    if !ok {
                        let _ = self.leases.redeem(lease);
                        self.last = Some(last);
                        return Ok(r);
                    }
                    r += 1;
                } else {
                    self.last = Some(last);
                }
            }
            if self.cur.is_none() {
                assert!(self.returned == 0 || self.avail == self.returned);
                self.cur = body.chunks.front().map(Arc::clone);
            }
            if self.cur.is_none() {
                assert_eq!(self.avail, self.returned);
            }

            while self.avail > self.returned && !scarab.is_full() {
                let st = match self.cur.as_ref() {
                    Some(st) => Arc::clone(st),
                    None => panic!("committed bytes without a chunk"),
                };
                assert!(self.st_off <= st.space());
                let av = (self.avail - self.returned) as usize;
                let mut l = st.space() - self.st_off;
                assert!(l > 0);
                if l > av {
                    l = av;
                }
                let (ptr, len) = st.region(self.st_off, l);
                let lease;
                if self.st_off + l == st.space() {
                    let next = Self::chunk_after(&body, &st);
                    assert!(self.last.is_none());
                    if next.is_none() {
                        self.last = Some(Arc::clone(&st));
                        lease = LEASE_NORET;
                    } else {
                        lease = self.leases.issue(&st);
                    }
                    self.st_off = 0;
                    self.cur = next;
                } else {
                    lease = LEASE_NORET;
                    self.st_off += l;
                }
                self.returned += l as u64;
                let ok = scarab.push(Viov { ptr, len, lease });
                assert!(ok);
                r += 1;
            }
        }

        if state != BocState::Finished && self.avail == self.returned {
            let (avail, st) = boc.vai_get_extend(self.returned, &self.notify);
            self.avail = avail;
            state = st;
        }
        if state == BocState::Finished && self.avail == self.returned {
            scarab.flags |= crate::storage::vai::VSCARAB_F_END;
        }
        Ok(r)
    }
}

impl VaiHandle for SmlHdl {
    fn lease(
        &mut self,
        _wrk: &mut Worker,
        scarab: &mut VScarab,
    ) -> Result<usize, VaiError> {
        if self.boc.is_some() {
            self.lease_boc(scarab)
        } else {
            self.lease_simple(scarab)
        }
    }

    fn buffer(
        &mut self,
        wrk: &mut Worker,
        scarab: &mut VScarab,
    ) -> Result<usize, VaiError> {
        let mut r = 0;
        for vio in scarab.s.iter_mut() {
            if vio.len == 0 {
                return Err(VaiError::Inval);
            }
        }
        for vio in scarab.s.iter_mut() {
            let Ok(st) = alloc_with_nuke(wrk, &self.stv, vio.len, false) else {
                break;
            };
            assert!(st.space() >= vio.len);
            st.mark_buffer();
            st.set_len(st.space());
            let (ptr, len) = st.region(0, st.space());
            vio.ptr = ptr;
            vio.len = len;
            vio.lease = self.leases.issue(&st);
            r += 1;
        }
        if r == 0 {
            // No free space right now; poke the notifier a little later
            // from a helper thread so the consumer can retry.
            let notify = Arc::clone(&self.notify);
            let _ = std::thread::spawn(move || {
                time::sleep(0.0042);
                notify.notify();
            });
            return Err(VaiError::Again);
        }
        Ok(r)
    }

    fn return_leases(&mut self, _wrk: &mut Worker, scaret: &mut VScaret) {
        if scaret.used() == 0 {
            return;
        }
        let mut todo = Vec::with_capacity(scaret.used());
        for &lease in &scaret.leases {
            if lease == LEASE_NORET {
                continue;
            }
            if let Some(st) = self.leases.redeem(lease) {
                todo.push(st);
            }
        }
        scaret.reset();

        if self.transient {
            // Streaming "free behind": unlink returned body chunks so the
            // allocator can reuse them while the fetch continues.
            let boc = self.boc.as_ref().map(Arc::clone);
            let mut body = self.obj.body();
            for st in &todo {
                if st.flags() & CHUNK_F_BUFFER != 0 {
                    continue;
                }
                body.chunks.retain(|c| !Arc::ptr_eq(c, st));
                if let Some(boc) = boc.as_ref() {
                    // If trim parked this chunk, this return is its free.
                    let _ = boc.clear_leftover_if(st);
                }
            }
            drop(body);
            for st in todo {
                self.stv.sml_free(st);
            }
        } else {
            // Only scratch buffers are reclaimed for cached objects; the
            // body stays until the object is freed.
            for st in todo {
                if st.flags() & CHUNK_F_BUFFER != 0 {
                    self.stv.sml_free(st);
                }
            }
        }
    }

    fn finish(&mut self, _wrk: &mut Worker) {
        if let Some(boc) = self.boc.take() {
            boc.vai_cancel(&self.notify);
        }
        self.leases.map.clear();
    }
}

// ---------------------------------------------------------------------
// Generic blocking iterator

const SCARAB_CAP: usize = 16;
const SCARET_CAP: usize = 16;

/// Delivers the body to `func` using the lease loop and a blocking
/// notifier.
///
/// The bytes observed by `func` are exactly the bytes committed by
/// successive extends, in order, with no duplication. `flush` is set on
/// the last span before the iterator would block and when the lease
/// return budget forces a return; `end` accompanies the final span.
pub fn iterator(
    wrk: &mut Worker,
    oc: &Arc<ObjCore>,
    func: IterateItem<'_>,
    _final: bool,
) -> Result<(), DeliverError> {
    let sn = Arc::new(BlockingNotify::new());
    let stv = oc.stevedore();
    let mut hdl = match stv.vai_init(wrk, oc, Arc::clone(&sn) as Arc<dyn VaiNotify>) {
        Some(h) => h,
        None => panic!("storage does not support iteration"),
    };

    let mut scarab = VScarab::new(SCARAB_CAP);
    let mut scaret = VScaret::new(SCARET_CAP);
    let mut result: Result<(), DeliverError> = Ok(());
    let mut saw_end = false;

    loop {
        let mut nn = hdl.lease(wrk, &mut scarab);
        while let Ok(n) = nn {
            if n == 0
                || scarab.flags & crate::storage::vai::VSCARAB_F_END != 0
                || scarab.is_full()
            {
                break;
            }
            nn = hdl.lease(wrk, &mut scarab);
        }

        let entries = std::mem::take(&mut scarab.s);
        let scarab_end = scarab.flags & crate::storage::vai::VSCARAB_F_END != 0;
        let nlast = entries.len().saturating_sub(1);
        let mut flushed = false;
        let mut aborted_at = None;
        for (i, vio) in entries.iter().enumerate() {
            let islast = i == nlast;
            assert!(!saw_end);
            if islast && scarab_end {
                saw_end = true;
            }
            let mut flags = IterFlags {
                flush: false,
                end: saw_end,
            };
            // Flush on the scarab's last entry when we will block next,
            // and when the lease-return vector is about to fill up.
            if (islast && nn.is_err()) || scaret.used() == scaret.capacity() - 1 {
                flags.flush = true;
                flushed = true;
            }
            if vio.ptr.is_null() {
                // Null entry: only carries a resume lease to return.
            } else {
                // SAFETY: the lease on this region is still outstanding.
                let data = unsafe { vio.as_slice() };
                if let Err(e) = func(flags, data) {
                    result = Err(e);
                    aborted_at = Some(i);
                    break;
                }
            }
            scaret.add(vio.lease);
            if flags.flush && scaret.used() > 0 {
                hdl.return_leases(wrk, &mut scaret);
            }
        }

        // Return leases we did not deliver after an abort.
        if let Some(stop) = aborted_at {
            for vio in &entries[stop..] {
                if scaret.is_full() {
                    hdl.return_leases(wrk, &mut scaret);
                }
                scaret.add(vio.lease);
            }
        }
        scarab.reset();

        let wait = matches!(nn, Err(VaiError::Again) | Err(VaiError::NoBufs));
        if result.is_ok() && wait && !flushed {
            result = func(IterFlags { flush: true, end: false }, &[]);
            if scaret.used() > 0 {
                hdl.return_leases(wrk, &mut scaret);
            }
        }
        if result.is_ok() && wait {
            sn.wait();
        } else if result.is_ok() {
            if let Err(e) = nn {
                assert_eq!(e, VaiError::Pipe);
                result = Err(DeliverError::FetchFailed);
            }
        }

        let done = match nn {
            Ok(0) => true,
            Ok(_) => false,
            Err(_) => false,
        };
        if result.is_err() || (done && !wait) {
            break;
        }
        if saw_end {
            break;
        }
    }

    if !saw_end {
        let r2 = func(IterFlags { flush: false, end: true }, &[]);
        if result.is_ok() {
            result = r2;
        }
    }

    if scaret.used() > 0 {
        hdl.return_leases(wrk, &mut scaret);
    }
    hdl.finish(wrk);
    result
}
