//! Debug stevedore: a deliberately awkward wrapper for tests.
//!
//! Wraps a malloc stevedore and misbehaves on purpose:
//! - `lessspace` mode returns one byte less than every space request,
//!   forcing callers through their short-allocation paths.
//! - `dopen=<seconds>` delays `vai_init`, widening the race window
//!   between fetcher and deliverers.

use std::sync::Arc;

use crate::common::error::{AllocError, StorageArgError};
use crate::common::time;
use crate::obj::ObjCore;
use crate::stats::{StevedoreStats, Worker};
use crate::storage::chunk::{BodySpace, Chunk};
use crate::storage::lru::Lru;
use crate::storage::malloc::MallocStevedore;
use crate::storage::vai::{VaiHandle, VaiNotify};
use crate::storage::{Stevedore, simple};

/// The wrapper stevedore.
pub struct DebugStevedore {
    ident: String,
    inner: MallocStevedore,
    lessspace: bool,
    dopen: f64,
}

impl std::fmt::Debug for DebugStevedore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugStevedore")
            .field("ident", &self.ident)
            .field("lessspace", &self.lessspace)
            .field("dopen", &self.dopen)
            .finish()
    }
}

impl DebugStevedore {
    /// Creates an instance from `-s` arguments: `lessspace` and/or
    /// `dopen=<seconds>`.
    pub fn open(ident: &str, args: &[&str]) -> Result<Arc<Self>, StorageArgError> {
        let mut lessspace = false;
        let mut dopen = 0.0;
        for a in args {
            if *a == "lessspace" {
                lessspace = true;
            } else if let Some(v) = a.strip_prefix("dopen=") {
                dopen = v.parse().map_err(|_| {
                    StorageArgError::Spec(format!("(debug) bad dopen {v:?}"))
                })?;
            } else if !a.is_empty() {
                return Err(StorageArgError::Spec(format!(
                    "(debug) unknown argument {a:?}"
                )));
            }
        }
        Ok(Arc::new(Self {
            ident: ident.to_string(),
            inner: MallocStevedore::with_cap(&format!("{ident}.inner"), u64::MAX),
            lessspace,
            dopen,
        }))
    }
}

impl Stevedore for DebugStevedore {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn ident(&self) -> &str {
        &self.ident
    }

    fn stats(&self) -> &StevedoreStats {
        self.inner.stats()
    }

    fn lru(&self) -> Option<&Arc<Lru>> {
        self.inner.lru()
    }

    fn sml_alloc(&self, size: usize) -> Result<Arc<Chunk>, AllocError> {
        self.inner.sml_alloc(size)
    }

    fn sml_free(&self, chunk: Arc<Chunk>) {
        self.inner.sml_free(chunk);
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

    fn objgetspace(
        &self,
        wrk: &mut Worker,
        oc: &ObjCore,
        sz: usize,
    ) -> Result<BodySpace, AllocError> {
        let space = simple::getspace(wrk, oc, sz)?;
        if self.lessspace && space.len() > 2 {
            // Return one byte less than we got, so callers exercise the
            // split-write path.
            Ok(BodySpace::new(space.as_mut_ptr(), space.len() - 1))
        } else {
            Ok(space)
        }
    }

    fn vai_init(
        &self,
        wrk: &mut Worker,
        oc: &Arc<ObjCore>,
        notify: Arc<dyn VaiNotify>,
    ) -> Option<Box<dyn VaiHandle>> {
        if self.dopen > 0.0 {
            time::sleep(self.dopen);
        }
        simple::vai_init(wrk, oc, notify)
    }
}
