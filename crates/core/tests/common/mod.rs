//! Shared test fixtures.

use std::sync::Arc;

use objcache_core::common::error::DeliverError;
use objcache_core::obj::ObjCore;
use objcache_core::obj::boc::BocState;
use objcache_core::stats::Worker;
use objcache_core::storage::malloc::MallocStevedore;
use objcache_core::storage::{Stevedore, new_object};

/// A fresh worker context.
pub fn worker() -> Worker {
    Worker::new()
}

/// An unlimited malloc stevedore for object plumbing tests.
pub fn malloc_stv(ident: &str) -> Arc<dyn Stevedore> {
    Arc::new(MallocStevedore::with_cap(ident, u64::MAX))
}

/// A capped malloc stevedore.
pub fn malloc_stv_capped(ident: &str, cap: u64) -> Arc<dyn Stevedore> {
    Arc::new(MallocStevedore::with_cap(ident, cap))
}

/// A busy objcore bound to the given stevedore with a default attribute
/// reserve.
pub fn busy_object(wrk: &mut Worker, stv: &Arc<dyn Stevedore>) -> Arc<ObjCore> {
    let oc = ObjCore::new(wrk);
    new_object(wrk, stv, &oc, 256).expect("object allocation");
    oc
}

/// Writes a complete body, stamps LEN and finishes the object.
pub fn finish_body(wrk: &mut Worker, oc: &Arc<ObjCore>, body: &[u8]) {
    use objcache_core::obj::attr::ObjAttr;
    oc.write_body(wrk, body, true).expect("body fits");
    oc.set_u64(wrk, ObjAttr::Len, body.len() as u64)
        .expect("len attribute");
    oc.set_state(wrk, BocState::Finished);
}

/// Collects the delivered body bytes through the iterator.
pub fn collect_body(wrk: &mut Worker, oc: &Arc<ObjCore>) -> Result<Vec<u8>, DeliverError> {
    let mut out = Vec::new();
    oc.iterate(
        wrk,
        &mut |_flags, data| {
            out.extend_from_slice(data);
            Ok(())
        },
        true,
    )?;
    Ok(out)
}

/// A deterministic pseudo-random body of `len` bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
