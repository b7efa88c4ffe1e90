//! Storage stevedores: the polymorphic storage layer.
//!
//! A *stevedore* is a pluggable storage engine; one instance manages one
//! backing (a bounded heap, an mmap'd file, a slab cache, a persistent
//! silo, or synthetic on-request data). This module provides:
//! 1. **The contract:** The [`Stevedore`] trait covering allocation,
//!    object methods, async iteration and ban journaling.
//! 2. **Shared machinery:** Chunks, LRU nuking and the simple-storage
//!    (SML) helpers most stevedores reuse.
//! 3. **The registry:** `-s`-style configuration with ident rules and the
//!    reserved `Transient` instance.

/// Body storage chunks and writable regions.
pub mod chunk;
/// Debug stevedore: deliberately awkward wrapper for tests.
pub mod debug;
/// File stevedore: mmap'd file with bucketed best-fit free lists.
pub mod file;
/// Per-stevedore LRU list and nuking.
pub mod lru;
/// Malloc stevedore: bounded system-allocator storage.
pub mod malloc;
/// Persistent silo stevedore.
pub mod persistent;
/// Shared simple-storage (SML) helpers.
pub mod simple;
/// Synth stevedore: zero-copy synthetic bodies.
pub mod synth;
/// Umem stevedore: slab-class variant of malloc.
pub mod umem;
/// Async iteration: leases, scarabs, notification.
pub mod vai;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use crate::common::error::{AllocError, DeliverError, StorageArgError};
use crate::obj::ObjCore;
use crate::obj::boc::{Boc, BocState};
use crate::stats::{StevedoreStats, Worker};

use self::chunk::{BodySpace, Chunk};
use self::lru::Lru;
use self::persistent::SiloObj;
use self::simple::SmlObject;
use self::synth::SynthObject;
use self::vai::{VaiHandle, VaiNotify};

/// Reserved ident of the transient stevedore.
pub const TRANSIENT_STORAGE: &str = "Transient";

/// Maximum stevedore ident length in bytes.
pub const IDENT_MAX: usize = 15;

/// Delivery callback: receives flags and one span of body bytes, in
/// commit order. `flush` marks points where buffered output should be
/// pushed; `end` accompanies (or follows) the final span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterFlags {
    /// Push buffered output downstream now.
    pub flush: bool,
    /// No more body bytes follow.
    pub end: bool,
}

/// The delivery callback handed to `objiterator`.
pub type IterateItem<'a> =
    &'a mut dyn FnMut(IterFlags, &[u8]) -> Result<(), DeliverError>;

/// Stevedore-private per-object state.
#[derive(Clone)]
pub enum StorePriv {
    /// Simple-storage object (malloc, file, umem, debug).
    Sml(Arc<SmlObject>),
    /// Synthetic scarab-backed object.
    Synth(Arc<SynthObject>),
    /// Persistent silo object.
    Silo(Arc<SiloObj>),
}

impl std::fmt::Debug for StorePriv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorePriv::Sml(_) => f.write_str("StorePriv::Sml"),
            StorePriv::Synth(_) => f.write_str("StorePriv::Synth"),
            StorePriv::Silo(_) => f.write_str("StorePriv::Silo"),
        }
    }
}

/// Ban journal events forwarded to stevedores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanInfo {
    /// A new ban was issued; its serialized form should be journaled.
    New,
    /// A ban was dropped; stevedores that only append may ignore this.
    Drop,
}

/// The storage engine contract.
///
/// Required methods cover identification and object creation; the object
/// methods default to the shared simple-storage implementations, which
/// resolve the per-object state through the objcore. Engines with their
/// own layout (synth) override the lot.
pub trait Stevedore: Send + Sync {
    /// Strategy name (`"malloc"`, `"file"`, ...).
    fn name(&self) -> &'static str;

    /// Instance ident (unique per configuration).
    fn ident(&self) -> &str;

    /// Allocation counters.
    fn stats(&self) -> &StevedoreStats;

    /// The LRU list, when this stevedore supports nuking.
    fn lru(&self) -> Option<&Arc<Lru>> {
        None
    }

    /// Allocates one storage chunk of at most `size` bytes.
    fn sml_alloc(&self, _size: usize) -> Result<Arc<Chunk>, AllocError> {
        Err(AllocError::Full)
    }

    /// Releases a chunk obtained from [`Stevedore::sml_alloc`].
    fn sml_free(&self, _chunk: Arc<Chunk>) {}

    /// Resolves the simple-storage object behind `oc`, running any
    /// deferred fix-up (persistent silo resurrection).
    fn sml_getobj(&self, _wrk: &mut Worker, oc: &ObjCore) -> Option<Arc<SmlObject>> {
        match oc.store_priv() {
            Some(StorePriv::Sml(o)) => Some(o),
            _ => None,
        }
    }

    /// Creates the object backing for `oc` (body head + attribute
    /// reserve of `wsl` bytes) and installs the store binding.
    fn allocobj(
        &self,
        wrk: &mut Worker,
        this: &Arc<dyn Stevedore>,
        oc: &Arc<ObjCore>,
        wsl: usize,
    ) -> Result<(), AllocError>;

    /// Allocates a scratch buffer (filters, probe bodies).
    fn allocbuf(
        &self,
        wrk: &mut Worker,
        this: &Arc<dyn Stevedore>,
        size: usize,
    ) -> Result<Arc<Chunk>, AllocError> {
        let st = simple::alloc_with_nuke(wrk, this, size, false)?;
        st.mark_buffer();
        st.set_len(size.min(st.space()));
        Ok(st)
    }

    /// Releases a scratch buffer.
    fn freebuf(&self, _wrk: &mut Worker, chunk: Arc<Chunk>) {
        assert!(chunk.flags() & chunk::CHUNK_F_BUFFER != 0);
        self.sml_free(chunk);
    }

    // --- object methods -------------------------------------------------

    /// Releases all body storage; called on LRU nuke or replace.
    fn objfree(&self, wrk: &mut Worker, oc: &Arc<ObjCore>) {
        simple::objfree(wrk, oc);
    }

    /// Delivers the body to `func` in commit order.
    fn objiterator(
        &self,
        wrk: &mut Worker,
        oc: &Arc<ObjCore>,
        func: IterateItem<'_>,
        final_: bool,
    ) -> Result<(), DeliverError> {
        simple::iterator(wrk, oc, func, final_)
    }

    /// Obtains writable body space (`sz` is a hint, 0 = default).
    fn objgetspace(
        &self,
        wrk: &mut Worker,
        oc: &ObjCore,
        sz: usize,
    ) -> Result<BodySpace, AllocError> {
        simple::getspace(wrk, oc, sz)
    }

    /// Commits `l` bytes written after the last getspace.
    fn objextend(&self, wrk: &mut Worker, oc: &ObjCore, l: usize) {
        simple::extend(wrk, oc, l);
    }

    /// Releases over-allocation on the final extend.
    fn objtrimstore(&self, wrk: &mut Worker, oc: &ObjCore) {
        simple::trimstore(wrk, oc);
    }

    /// The BOC is retiring; release trim leftovers and enter the LRU.
    fn objbocdone(&self, wrk: &mut Worker, oc: &Arc<ObjCore>, boc: &Arc<Boc>) {
        simple::bocdone(wrk, oc, boc);
    }

    /// Releases body storage while keeping attributes.
    fn objslim(&self, wrk: &mut Worker, oc: &ObjCore) {
        simple::slim(wrk, oc);
    }

    /// Reads an attribute.
    fn objgetattr(
        &self,
        wrk: &mut Worker,
        oc: &ObjCore,
        attr: crate::obj::attr::ObjAttr,
    ) -> Option<Vec<u8>> {
        simple::getattr(wrk, oc, attr)
    }

    /// Writes an attribute.
    fn objsetattr(
        &self,
        wrk: &mut Worker,
        oc: &ObjCore,
        attr: crate::obj::attr::ObjAttr,
        data: &[u8],
    ) -> Result<(), AllocError> {
        simple::setattr(wrk, oc, attr, data)
    }

    /// LRU update hint.
    fn objtouch(&self, _wrk: &mut Worker, oc: &Arc<ObjCore>, now: f64) {
        if let Some(lru) = self.lru() {
            lru.touch(oc, now);
        }
    }

    /// Optional state-change hook, called before the BOC mutex is taken.
    fn objsetstate(&self, _wrk: &mut Worker, _oc: &ObjCore, _state: BocState) {}

    /// Starts an asynchronous (lease based) iteration.
    fn vai_init(
        &self,
        wrk: &mut Worker,
        oc: &Arc<ObjCore>,
        notify: Arc<dyn VaiNotify>,
    ) -> Option<Box<dyn VaiHandle>> {
        simple::vai_init(wrk, oc, notify)
    }

    // --- ban journal / lifecycle ---------------------------------------

    /// Ban journal event; persistent stevedores append to their journal.
    fn baninfo(&self, _event: BanInfo, _ban: &[u8]) -> Result<(), AllocError> {
        Ok(())
    }

    /// Bulk replacement of the ban journal after lurker compaction.
    fn banexport(&self, _bans: &[u8]) {}

    /// Shuts the stevedore down. `warn` is the advance notice pass;
    /// the final pass joins housekeeping threads.
    fn close(&self, _warn: bool) {}
}

/// Associates a stevedore with an objcore, allocating the object backing.
///
/// On allocation failure the stevedore has already attempted LRU nuking;
/// the error is final for this stevedore.
pub fn new_object(
    wrk: &mut Worker,
    stv: &Arc<dyn Stevedore>,
    oc: &Arc<ObjCore>,
    wsl: usize,
) -> Result<(), AllocError> {
    stv.allocobj(wrk, stv, oc, wsl)
}

/// The process-wide stevedore registry.
///
/// Mutated only by the management thread during startup; read from
/// everywhere.
pub struct StorageRegistry {
    list: RwLock<Vec<Arc<dyn Stevedore>>>,
    seq: AtomicU32,
}

impl std::fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRegistry").finish_non_exhaustive()
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            list: RwLock::new(Vec::new()),
            seq: AtomicU32::new(0),
        }
    }

    /// Returns the process-wide registry.
    pub fn global() -> &'static StorageRegistry {
        static GLOBAL: OnceLock<StorageRegistry> = OnceLock::new();
        GLOBAL.get_or_init(StorageRegistry::new)
    }

    /// Parses and instantiates a `-s` style storage specification:
    /// `[name=]strategy[,arg]*`.
    pub fn configure(&self, spec: &str) -> Result<Arc<dyn Stevedore>, StorageArgError> {
        let (ident, rest) = match spec.split_once('=') {
            // A '=' after the first ',' belongs to an argument.
            Some((name, rest))
                if !name.contains(',') =>
            {
                (Some(name.to_string()), rest)
            }
            _ => (None, spec),
        };
        let mut parts = rest.split(',');
        let strategy = parts.next().unwrap_or("").trim();
        if strategy.is_empty() {
            return Err(StorageArgError::Spec(
                "specification lacks a strategy {malloc, file, ...}".into(),
            ));
        }
        let args: Vec<&str> = parts.collect();

        let ident = match ident {
            Some(mut i) => {
                i.truncate(IDENT_MAX);
                i
            }
            None => format!("s{}", self.seq.fetch_add(1, Ordering::Relaxed)),
        };
        if self.find(&ident).is_some() {
            return Err(StorageArgError::DuplicateIdent(ident));
        }

        let stv: Arc<dyn Stevedore> = match strategy {
            "malloc" => malloc::MallocStevedore::open(&ident, &args)?,
            "file" => file::FileStevedore::open(&ident, &args)?,
            "umem" => umem::UmemStevedore::open(&ident, &args)?,
            "persistent" => persistent::SiloStevedore::open(&ident, &args)?,
            "debug" => debug::DebugStevedore::open(&ident, &args)?,
            other => {
                return Err(StorageArgError::Spec(format!(
                    "unknown storage strategy {other:?}"
                )));
            }
        };
        self.add(Arc::clone(&stv));
        Ok(stv)
    }

    /// Registers an already-built stevedore.
    pub fn add(&self, stv: Arc<dyn Stevedore>) {
        self.list
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(stv);
    }

    /// Looks an instance up by ident.
    pub fn find(&self, ident: &str) -> Option<Arc<dyn Stevedore>> {
        self.list
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .find(|s| s.ident() == ident)
            .map(Arc::clone)
    }

    /// The transient stevedore, if one was configured.
    pub fn transient(&self) -> Option<Arc<dyn Stevedore>> {
        self.find(TRANSIENT_STORAGE)
    }

    /// (ident, strategy) pairs of all configured instances.
    pub fn list(&self) -> Vec<(String, &'static str)> {
        self.list
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|s| (s.ident().to_string(), s.name()))
            .collect()
    }

    /// Shuts all stevedores down (warn pass, then final pass).
    pub fn close_all(&self) {
        let list: Vec<_> = self
            .list
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(Arc::clone)
            .collect();
        for s in &list {
            s.close(true);
        }
        for s in &list {
            s.close(false);
        }
    }
}
