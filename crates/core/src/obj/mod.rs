//! The object core: cache entries and their lifecycle.
//!
//! This module implements the record at the heart of the cache. It
//! provides:
//! 1. **ObjCore:** The small record representing a cache entry, with its
//!    flags, expiry parameters and storage binding.
//! 2. **Lifecycle:** Creation, storage association, attribute population,
//!    body streaming, retirement and teardown.
//! 3. **Typed attribute access:** Thin accessors over the stevedore
//!    attribute methods, including the endian-agnostic numeric encoding.
//!
//! Lifetime of an objcore:
//! - phase 0: nonexistent
//! - phase 1: created ([`ObjCore::new`]), no stevedore associated
//! - phase 2: stevedore associated, being filled out (`set_state`,
//!   `get_space`/`extend`/`wait_extend`, attribute writes)
//! - phase 3: stable after [`ObjCore::boc_done`], no changes happening
//! - phase 4: unavailable, being dismantled ([`ObjCore::kill`] /
//!   [`ObjCore::snipe`])
//! - phase 5: stevedore disassociated ([`ObjCore::free_obj`])
//! - phase 6: nonexistent

/// Object attribute and flag definitions.
pub mod attr;
/// The busy-object core shared between fetcher and deliverers.
pub mod boc;
/// The object event bus (ban/ttl/insert notifications).
pub mod event;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::encode::{be32dec, be32enc, be64dec, be64enc, bedoubledec, bedoubleenc};
use crate::common::error::{AllocError, DeliverError};
use crate::config::Config;
use crate::stats::Worker;
use crate::storage::chunk::BodySpace;
use crate::storage::{IterateItem, StorePriv, Stevedore};

use self::attr::{ObjAttr, oc_flags};
use self::boc::{Boc, BocState};

/// Expiry parameters of a cache entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Expiry {
    /// Absolute time the object entered the cache.
    pub t_origin: f64,
    /// Time to live, relative to `t_origin`.
    pub ttl: f64,
    /// Grace period after TTL expiry.
    pub grace: f64,
    /// Keep period for conditional revalidation.
    pub keep: f64,
}

impl Expiry {
    /// Absolute time after which the object is of no use at all.
    pub fn when(&self) -> f64 {
        self.t_origin + self.ttl + self.grace + self.keep
    }
}

/// Storage binding of an objcore: the owning stevedore plus its private
/// per-object state.
pub struct StoreObj {
    /// The stevedore holding this object's storage.
    pub stevedore: Arc<dyn Stevedore>,
    /// Stevedore-private object state.
    pub priv_: StorePriv,
}

impl std::fmt::Debug for StoreObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreObj")
            .field("stevedore", &self.stevedore.ident())
            .field("priv", &self.priv_)
            .finish()
    }
}

/// A cache entry.
///
/// Heap-allocated and shared; holds metadata and a handle to storage. The
/// body itself lives in the stevedore.
pub struct ObjCore {
    flags: AtomicU32,
    oa_present: AtomicU32,
    /// Wall-clock of the last LRU touch, as f64 bits; NaN if never seen.
    last_lru: AtomicU64,
    boc: Mutex<Option<Arc<Boc>>>,
    store: Mutex<Option<StoreObj>>,
    exp: Mutex<Expiry>,
    /// Ban timestamp the object was last evaluated against, as f64 bits.
    ban_time: AtomicU64,
    /// Cache-key digest, installed by the (out of scope) hash layer.
    digest: Mutex<Option<[u8; 32]>>,
}

impl std::fmt::Debug for ObjCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjCore")
            .field("flags", &self.flags())
            .field("oa_present", &self.oa_present())
            .field("busy", &self.boc().is_some())
            .finish_non_exhaustive()
    }
}

fn lock<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl ObjCore {
    /// Creates a new busy objcore with a fresh BOC and no stevedore.
    pub fn new(wrk: &mut Worker) -> Arc<Self> {
        wrk.stats.n_objectcore += 1;
        Arc::new(Self {
            flags: AtomicU32::new(oc_flags::BUSY),
            oa_present: AtomicU32::new(0),
            last_lru: AtomicU64::new(f64::NAN.to_bits()),
            boc: Mutex::new(Some(Boc::new(Config::get().params.transit_buffer))),
            store: Mutex::new(None),
            exp: Mutex::new(Expiry::default()),
            ban_time: AtomicU64::new(0f64.to_bits()),
            digest: Mutex::new(None),
        })
    }

    /// Cache-key digest, if the hash layer installed one.
    pub fn digest(&self) -> Option<[u8; 32]> {
        *lock(&self.digest)
    }

    /// Installs the cache-key digest.
    pub fn set_digest(&self, d: [u8; 32]) {
        *lock(&self.digest) = Some(d);
    }

    /// Final teardown; the companion of [`ObjCore::new`].
    pub fn destroy(wrk: &mut Worker, oc: &Arc<Self>) {
        let _ = lock(&oc.boc).take();
        wrk.stats.n_objectcore -= 1;
    }

    // ------------------------------------------------------------------
    // Flags

    /// Current flag bits.
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    /// Sets the given flag bits.
    pub fn set_flags(&self, mask: u32) {
        let _ = self.flags.fetch_or(mask, Ordering::AcqRel);
    }

    /// Clears the given flag bits.
    pub fn clear_flags(&self, mask: u32) {
        let _ = self.flags.fetch_and(!mask, Ordering::AcqRel);
    }

    /// True if any of the given flag bits is set.
    pub fn has_flag(&self, mask: u32) -> bool {
        self.flags() & mask != 0
    }

    /// Requests cancellation of the fetch feeding this object.
    pub fn cancel(&self) {
        self.set_flags(oc_flags::CANCEL);
    }

    /// Marks the object unavailable (lifecycle 3 → 4).
    pub fn kill(&self) {
        self.set_flags(oc_flags::DYING);
    }

    /// Kills the object only if nothing but the caller and the cache
    /// infrastructure reference it. Returns whether the object was killed.
    pub fn snipe(self: &Arc<Self>, max_refs: usize) -> bool {
        if self.has_flag(oc_flags::DYING) {
            return true;
        }
        if Arc::strong_count(self) <= max_refs {
            self.kill();
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Expiry / ban bookkeeping

    /// Returns the expiry parameters.
    pub fn exp(&self) -> Expiry {
        *lock(&self.exp)
    }

    /// Replaces the expiry parameters.
    pub fn set_exp(&self, e: Expiry) {
        *lock(&self.exp) = e;
    }

    /// Ban evaluation timestamp.
    pub fn ban_time(&self) -> f64 {
        f64::from_bits(self.ban_time.load(Ordering::Relaxed))
    }

    /// Updates the ban evaluation timestamp.
    pub fn set_ban_time(&self, t: f64) {
        self.ban_time.store(t.to_bits(), Ordering::Relaxed);
    }

    /// Wall-clock of the last LRU touch; NaN if the LRU has never seen
    /// this object.
    pub fn last_lru(&self) -> f64 {
        f64::from_bits(self.last_lru.load(Ordering::Relaxed))
    }

    /// Stamps the LRU touch time.
    pub fn set_last_lru(&self, t: f64) {
        self.last_lru.store(t.to_bits(), Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // BOC handling

    /// Returns the attached BOC, if the object is still busy.
    pub fn boc(&self) -> Option<Arc<Boc>> {
        lock(&self.boc).clone()
    }

    fn boc_must(&self) -> Arc<Boc> {
        match self.boc() {
            Some(b) => b,
            None => panic!("operation requires a busy object"),
        }
    }

    /// Called when the fetcher is done with the object; invokes the
    /// stevedore's boc-done hook and retires the BOC. Subsequent
    /// attribute reads go directly to stored attributes.
    pub fn boc_done(self: &Arc<Self>, wrk: &mut Worker) {
        let boc = match lock(&self.boc).take() {
            Some(b) => b,
            None => panic!("boc_done on an object without a boc"),
        };
        if let Some(stv) = self.stevedore_opt() {
            stv.objbocdone(wrk, self, &boc);
        }
        self.clear_flags(oc_flags::BUSY);
    }

    // ------------------------------------------------------------------
    // Storage binding

    /// Installs the storage binding; called from a stevedore's allocobj.
    pub fn bind_store(&self, stevedore: Arc<dyn Stevedore>, priv_: StorePriv) {
        let mut st = lock(&self.store);
        assert!(st.is_none(), "objcore already has a stevedore");
        *st = Some(StoreObj { stevedore, priv_ });
    }

    /// The owning stevedore; panics if no storage is bound.
    pub fn stevedore(&self) -> Arc<dyn Stevedore> {
        match self.stevedore_opt() {
            Some(s) => s,
            None => panic!("objcore has no stevedore"),
        }
    }

    /// The owning stevedore, or `None` before phase 2 / after phase 5.
    pub fn stevedore_opt(&self) -> Option<Arc<dyn Stevedore>> {
        lock(&self.store).as_ref().map(|s| Arc::clone(&s.stevedore))
    }

    /// Clone of the stevedore-private object state.
    pub fn store_priv(&self) -> Option<StorePriv> {
        lock(&self.store).as_ref().map(|s| s.priv_.clone())
    }

    /// Drops the storage binding; called from a stevedore's objfree.
    pub fn unbind_store(&self) {
        let _ = lock(&self.store).take();
    }

    /// Releases all object storage and disassociates the stevedore
    /// (lifecycle 4 → 5).
    pub fn free_obj(self: &Arc<Self>, wrk: &mut Worker) {
        let stv = self.stevedore();
        stv.objfree(wrk, self);
        assert!(self.stevedore_opt().is_none());
    }

    // ------------------------------------------------------------------
    // State machine

    /// Advances the BOC state.
    ///
    /// Preconditions: `next` must be greater than the current state;
    /// `Stream` is reachable only from `PrepStream`; `Finished` requires
    /// the LEN attribute. The stevedore's state hook runs before the BOC
    /// mutex is taken.
    pub fn set_state(&self, wrk: &mut Worker, next: BocState) {
        let boc = self.boc_must();
        assert!(next > boc.state(), "boc state may only move forward");
        assert!(
            next != BocState::Stream || boc.state() == BocState::PrepStream,
            "STREAM is reachable only from PREP_STREAM"
        );
        assert!(
            next != BocState::Finished
                || self.oa_present() & ObjAttr::Len.present_bit() != 0,
            "FINISHED requires the LEN attribute"
        );
        if let Some(stv) = self.stevedore_opt() {
            stv.objsetstate(wrk, self, next);
        }
        boc.advance(next);
    }

    /// Blocks until the BOC state reaches at least `want`.
    pub fn wait_state(&self, want: BocState) {
        let boc = self.boc_must();
        boc.wait_state(want, &|| self.has_flag(oc_flags::CANCEL));
    }

    // ------------------------------------------------------------------
    // Body building

    /// Requests writable body space.
    ///
    /// `sz` is a hint; 0 means "default" (the stevedore uses its fetch
    /// chunk size). The returned region is at least 1 byte. When a
    /// transit buffer is active, the hint is clamped to it.
    pub fn get_space(
        &self,
        wrk: &mut Worker,
        sz: usize,
    ) -> Result<BodySpace, AllocError> {
        let _boc = self.boc_must();
        let stv = self.stevedore();
        let space = stv.objgetspace(wrk, self, sz)?;
        assert!(space.len() > 0);
        Ok(space)
    }

    /// Commits `l` bytes written into the last [`ObjCore::get_space`]
    /// region.
    ///
    /// With an active transit buffer the fetcher first waits until the
    /// slowest deliverer has caught up enough, or the object is
    /// cancelled. On the final call, surplus space is trimmed.
    pub fn extend(&self, wrk: &mut Worker, l: usize, final_: bool) {
        let boc = self.boc_must();
        let stv = self.stevedore();
        if l > 0 {
            if boc.transit_buffer() > 0 {
                assert!(
                    self.has_flag(
                        oc_flags::PRIVATE | oc_flags::HFM | oc_flags::HFP
                    ),
                    "transit buffer requires a non-cached object"
                );
            }
            boc.throttle(&|| self.has_flag(oc_flags::CANCEL));
            stv.objextend(wrk, self, l);
            boc.commit(l as u64);
        }
        assert!(boc.state() < BocState::Finished);
        if final_ {
            stv.objtrimstore(wrk, self);
        }
    }

    /// Convenience for fetch loops and tests: writes `data` as one
    /// get-space / copy / extend cycle per chunk.
    pub fn write_body(&self, wrk: &mut Worker, mut data: &[u8], final_: bool) -> Result<(), AllocError> {
        while !data.is_empty() {
            let space = self.get_space(wrk, data.len())?;
            let n = space.len().min(data.len());
            space.write(&data[..n]);
            self.extend(wrk, n, false);
            data = &data[n..];
        }
        if final_ {
            self.extend(wrk, 0, true);
        }
        Ok(())
    }

    /// Deliverer-side wait for body bytes beyond offset `l`; returns the
    /// observed committed byte count and the state at wakeup.
    pub fn wait_extend(&self, l: u64) -> (u64, BocState) {
        self.boc_must().wait_extend(l)
    }

    /// Delivers the body to `func`, in commit order, using the owning
    /// stevedore's iterator.
    pub fn iterate(
        self: &Arc<Self>,
        wrk: &mut Worker,
        func: IterateItem<'_>,
        final_: bool,
    ) -> Result<(), DeliverError> {
        let stv = self.stevedore();
        stv.objiterator(wrk, self, func, final_)
    }

    /// Releases body storage while keeping attributes; no-op if the
    /// stevedore does not support slimming.
    pub fn slim(&self, wrk: &mut Worker) {
        let stv = self.stevedore();
        stv.objslim(wrk, self);
    }

    /// LRU touch hint.
    pub fn touch(self: &Arc<Self>, wrk: &mut Worker, now: f64) {
        let stv = self.stevedore();
        stv.objtouch(wrk, self, now);
    }

    // ------------------------------------------------------------------
    // Attributes

    /// Present-attribute bitmask.
    pub fn oa_present(&self) -> u32 {
        self.oa_present.load(Ordering::Acquire)
    }

    /// Checks whether the object has the given attribute.
    ///
    /// Resurrected persistent objects have an empty present mask; for
    /// those the check falls back to asking storage.
    pub fn has_attr(&self, wrk: &mut Worker, a: ObjAttr) -> bool {
        let present = self.oa_present();
        if present != 0 {
            return present & a.present_bit() != 0;
        }
        self.get_attr(wrk, a).is_some()
    }

    /// Reads an attribute; `None` when unset.
    pub fn get_attr(&self, wrk: &mut Worker, a: ObjAttr) -> Option<Vec<u8>> {
        let stv = self.stevedore();
        stv.objgetattr(wrk, self, a)
    }

    /// Writes an attribute.
    ///
    /// Fixed attributes are overwritten in place and must match their
    /// declared size. Variable attributes may be set only once; a re-set
    /// asserts the length is unchanged. Auxiliary attributes may fail on
    /// allocation.
    pub fn set_attr(
        &self,
        wrk: &mut Worker,
        a: ObjAttr,
        data: &[u8],
    ) -> Result<(), AllocError> {
        assert!((a as u8) < 16);
        assert!(self.boc().is_some(), "attributes are set while busy");
        let stv = self.stevedore();
        stv.objsetattr(wrk, self, a, data)?;
        let _ = self
            .oa_present
            .fetch_or(a.present_bit(), Ordering::AcqRel);
        Ok(())
    }

    /// Copies one attribute from `src` onto this object. Fails on an
    /// absent or empty source attribute.
    pub fn copy_attr_from(
        &self,
        wrk: &mut Worker,
        src: &ObjCore,
        a: ObjAttr,
    ) -> Result<(), AllocError> {
        let data = match src.get_attr(wrk, a) {
            Some(d) if !d.is_empty() => d,
            _ => return Err(AllocError::Full),
        };
        self.set_attr(wrk, a, &data)
    }

    /// Reads a big-endian `u64` attribute.
    pub fn get_u64(&self, wrk: &mut Worker, a: ObjAttr) -> Option<u64> {
        let d = self.get_attr(wrk, a)?;
        if d.len() != 8 {
            return None;
        }
        Some(be64dec(&d))
    }

    /// Writes a big-endian `u64` attribute.
    pub fn set_u64(
        &self,
        wrk: &mut Worker,
        a: ObjAttr,
        v: u64,
    ) -> Result<(), AllocError> {
        let mut buf = [0u8; 8];
        be64enc(&mut buf, v);
        self.set_attr(wrk, a, &buf)
    }

    /// Reads a big-endian `u32` attribute.
    pub fn get_u32(&self, wrk: &mut Worker, a: ObjAttr) -> Option<u32> {
        let d = self.get_attr(wrk, a)?;
        if d.len() != 4 {
            return None;
        }
        Some(be32dec(&d))
    }

    /// Writes a big-endian `u32` attribute.
    pub fn set_u32(
        &self,
        wrk: &mut Worker,
        a: ObjAttr,
        v: u32,
    ) -> Result<(), AllocError> {
        let mut buf = [0u8; 4];
        be32enc(&mut buf, v);
        self.set_attr(wrk, a, &buf)
    }

    /// Reads a double attribute (u64-punned, big-endian).
    pub fn get_double(&self, wrk: &mut Worker, a: ObjAttr) -> Option<f64> {
        let d = self.get_attr(wrk, a)?;
        if d.len() != 8 {
            return None;
        }
        Some(bedoubledec(&d))
    }

    /// Writes a double attribute (u64-punned, big-endian).
    pub fn set_double(
        &self,
        wrk: &mut Worker,
        a: ObjAttr,
        v: f64,
    ) -> Result<(), AllocError> {
        let mut buf = [0u8; 8];
        bedoubleenc(&mut buf, v);
        self.set_attr(wrk, a, &buf)
    }

    /// Body length; the LEN attribute must have been set.
    pub fn get_len(&self, wrk: &mut Worker) -> u64 {
        match self.get_u64(wrk, ObjAttr::Len) {
            Some(l) => l,
            None => panic!("LEN attribute not set"),
        }
    }

    /// Stores the fetch transaction id.
    pub fn set_xid(&self, wrk: &mut Worker, xid: u32) -> Result<(), AllocError> {
        self.set_u32(wrk, ObjAttr::Vxid, xid)
    }

    /// Reads the fetch transaction id.
    pub fn get_xid(&self, wrk: &mut Worker) -> Option<u32> {
        self.get_u32(wrk, ObjAttr::Vxid)
    }

    /// Tests an object flag (stored in the FLAGS attribute byte).
    pub fn check_obj_flag(&self, wrk: &mut Worker, flag: u8) -> bool {
        match self.get_attr(wrk, ObjAttr::Flags) {
            Some(d) => !d.is_empty() && d[0] & flag != 0,
            None => false,
        }
    }

    /// Sets or clears an object flag in the FLAGS attribute byte.
    pub fn set_obj_flag(
        &self,
        wrk: &mut Worker,
        flag: u8,
        val: bool,
    ) -> Result<(), AllocError> {
        let cur = self
            .get_attr(wrk, ObjAttr::Flags)
            .and_then(|d| d.first().copied())
            .unwrap_or(0);
        let next = if val { cur | flag } else { cur & !flag };
        self.set_attr(wrk, ObjAttr::Flags, &[next])
    }
}
