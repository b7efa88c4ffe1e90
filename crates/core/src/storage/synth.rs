//! Synth stevedore: zero-copy synthetic bodies.
//!
//! Purpose-built for synthesized responses: the generator appends
//! ready-made byte pieces and delivery walks them in place, no body
//! chunks, no copying. Only the LEN attribute (cached, big-endian) and
//! FLAGS (always 0) exist. Scratch buffers for filters come from the
//! regular heap.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock};

use crate::common::encode::be64enc;
use crate::common::error::{AllocError, VaiError};
use crate::obj::ObjCore;
use crate::obj::attr::ObjAttr;
use crate::stats::{StevedoreStats, Worker};
use crate::storage::chunk::{BodySpace, Chunk};
use crate::storage::vai::{
    LEASE_NORET, VScarab, VScaret, VaiHandle, VaiNotify, Viov,
};
use crate::storage::{StorePriv, Stevedore};

/// A synthetic body: an ordered list of ready-made pieces.
pub struct SynthObject {
    pieces: Mutex<Vec<Arc<[u8]>>>,
    len_be: OnceLock<[u8; 8]>,
}

impl std::fmt::Debug for SynthObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthObject")
            .field("pieces", &self.pieces().len())
            .finish_non_exhaustive()
    }
}

impl Default for SynthObject {
    fn default() -> Self {
        Self::new()
    }
}

impl SynthObject {
    /// Creates an empty body.
    pub fn new() -> Self {
        Self {
            pieces: Mutex::new(Vec::new()),
            len_be: OnceLock::new(),
        }
    }

    fn pieces(&self) -> std::sync::MutexGuard<'_, Vec<Arc<[u8]>>> {
        self.pieces
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Appends one piece to the body. Must happen before the length is
    /// first observed.
    pub fn append(&self, piece: Arc<[u8]>) {
        assert!(
            self.len_be.get().is_none(),
            "synth body extended after its length was published"
        );
        self.pieces().push(piece);
    }

    /// Total body length, computed once and cached big-endian.
    fn len_cache(&self) -> [u8; 8] {
        *self.len_be.get_or_init(|| {
            let l: u64 = self.pieces().iter().map(|p| p.len() as u64).sum();
            let mut buf = [0u8; 8];
            be64enc(&mut buf, l);
            buf
        })
    }
}

/// The synth stevedore. One process-wide instance suffices.
pub struct SynthStevedore {
    stats: StevedoreStats,
}

impl std::fmt::Debug for SynthStevedore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthStevedore").finish_non_exhaustive()
    }
}

impl Default for SynthStevedore {
    fn default() -> Self {
        Self::new()
    }
}

impl SynthStevedore {
    /// Creates the instance.
    pub fn new() -> Self {
        Self {
            stats: StevedoreStats::default(),
        }
    }

    /// The synthetic body behind `oc`.
    pub fn synth_obj(oc: &ObjCore) -> Option<Arc<SynthObject>> {
        match oc.store_priv() {
            Some(StorePriv::Synth(s)) => Some(s),
            _ => None,
        }
    }
}

struct SynthHdl {
    obj: Arc<SynthObject>,
    next: usize,
    /// Heap scratch buffers, keyed by lease token.
    buffers: Vec<(u64, Arc<Chunk>)>,
    seq: u64,
}

impl VaiHandle for SynthHdl {
    fn lease(
        &mut self,
        _wrk: &mut Worker,
        scarab: &mut VScarab,
    ) -> Result<usize, VaiError> {
        let pieces = self.obj.pieces();
        let mut r = 0;
        while self.next < pieces.len() {
            if scarab.is_full() {
                return Ok(r);
            }
            let p = &pieces[self.next];
            let ok = scarab.push(Viov {
                ptr: p.as_ptr(),
                len: p.len(),
                lease: LEASE_NORET,
            });
            assert!(ok);
            self.next += 1;
            r += 1;
        }
        scarab.flags |= crate::storage::vai::VSCARAB_F_END;
        Ok(r)
    }

    fn buffer(
        &mut self,
        _wrk: &mut Worker,
        scarab: &mut VScarab,
    ) -> Result<usize, VaiError> {
        for vio in scarab.s.iter() {
            if vio.len == 0 {
                return Err(VaiError::Inval);
            }
        }
        let mut r = 0;
        for vio in scarab.s.iter_mut() {
            let st = Arc::new(Chunk::new_heap(vio.len));
            st.mark_buffer();
            st.set_len(vio.len);
            let (ptr, len) = st.region(0, st.space());
            self.seq += 1;
            let lease = self.seq << 3;
            vio.ptr = ptr;
            vio.len = len;
            vio.lease = lease;
            self.buffers.push((lease, st));
            r += 1;
        }
        Ok(r)
    }

    fn return_leases(&mut self, _wrk: &mut Worker, scaret: &mut VScaret) {
        for &lease in &scaret.leases {
            if lease == LEASE_NORET {
                continue;
            }
            self.buffers.retain(|(l, _)| *l != lease);
        }
        scaret.reset();
    }

    fn finish(&mut self, _wrk: &mut Worker) {
        self.buffers.clear();
    }
}

impl Stevedore for SynthStevedore {
    fn name(&self) -> &'static str {
        "synth"
    }

    fn ident(&self) -> &str {
        "synth"
    }

    fn stats(&self) -> &StevedoreStats {
        &self.stats
    }

    fn allocobj(
        &self,
        _wrk: &mut Worker,
        this: &Arc<dyn Stevedore>,
        oc: &Arc<ObjCore>,
        wsl: usize,
    ) -> Result<(), AllocError> {
        assert_eq!(wsl, 0, "synth objects carry no attribute reserve");
        let _ = self.stats.c_req.fetch_add(1, Ordering::Relaxed);
        oc.bind_store(
            Arc::clone(this),
            StorePriv::Synth(Arc::new(SynthObject::new())),
        );
        Ok(())
    }

    fn objfree(&self, _wrk: &mut Worker, oc: &Arc<ObjCore>) {
        // The body is reference counted; nothing to free here.
        oc.unbind_store();
    }

    fn objgetspace(
        &self,
        _wrk: &mut Worker,
        _oc: &ObjCore,
        _sz: usize,
    ) -> Result<BodySpace, AllocError> {
        panic!("synth bodies are appended with SynthObject::append");
    }

    fn objextend(&self, _wrk: &mut Worker, _oc: &ObjCore, _l: usize) {
        panic!("synth bodies are appended with SynthObject::append");
    }

    fn objtrimstore(&self, _wrk: &mut Worker, _oc: &ObjCore) {}

    fn objbocdone(
        &self,
        _wrk: &mut Worker,
        _oc: &Arc<ObjCore>,
        _boc: &Arc<crate::obj::boc::Boc>,
    ) {
    }

    fn objslim(&self, _wrk: &mut Worker, _oc: &ObjCore) {}

    fn objgetattr(
        &self,
        _wrk: &mut Worker,
        oc: &ObjCore,
        attr: ObjAttr,
    ) -> Option<Vec<u8>> {
        match attr {
            ObjAttr::Flags => Some(vec![0]),
            ObjAttr::Len => {
                let obj = Self::synth_obj(oc)?;
                Some(obj.len_cache().to_vec())
            }
            _ => None,
        }
    }

    fn objsetattr(
        &self,
        _wrk: &mut Worker,
        _oc: &ObjCore,
        attr: ObjAttr,
        _data: &[u8],
    ) -> Result<(), AllocError> {
        // The length is derived from the pieces; the set is accepted and
        // ignored so generic fetch code keeps working.
        assert_eq!(attr, ObjAttr::Len);
        Ok(())
    }

    fn vai_init(
        &self,
        _wrk: &mut Worker,
        oc: &Arc<ObjCore>,
        _notify: Arc<dyn VaiNotify>,
    ) -> Option<Box<dyn VaiHandle>> {
        let obj = Self::synth_obj(oc)?;
        Some(Box::new(SynthHdl {
            obj,
            next: 0,
            buffers: Vec::new(),
            seq: 1,
        }))
    }
}
