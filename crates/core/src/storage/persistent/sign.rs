//! Signed blocks: torn-write detection for silo metadata.
//!
//! Every signed region has the shape
//! `{ ident[8], unique, mapped, length, payload[length], sha256 }`.
//! The digest covers the header up to but excluding `length`, then the
//! payload, then `length` itself — so an append rewrites only the
//! trailing digest, and a torn write anywhere leaves an
//! old-but-consistent block behind.
//!
//! `mapped` records the address at which the signature was last written;
//! it is informational (tooling can detect relocated maps) and does not
//! fail validation, since records address the silo by offset.

use sha2::{Digest, Sha256};
use tracing::debug;

use super::layout::{SHA256_LEN, SIGN_HDR_SIZE, SIGN_SPACE};

/// Offset of the `length` field within the signature header.
const LEN_OFF: usize = 24;

/// A signature context bound to one fixed location in the mapping.
pub struct SignCtx {
    ptr: *mut u8,
    id: [u8; 8],
    unique: u32,
    /// Payload capacity; a stored length beyond this is corruption and
    /// must not be dereferenced.
    limit: u64,
    /// Running hash of header-up-to-length plus the payload so far.
    ctx: Sha256,
}

// SAFETY: the pointer addresses the silo mapping, which outlives the
// context; sign mutation is serialized by the silo lock.
unsafe impl Send for SignCtx {}

impl std::fmt::Debug for SignCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignCtx")
            .field("id", &String::from_utf8_lossy(&self.id))
            .field("length", &self.length())
            .finish_non_exhaustive()
    }
}

impl SignCtx {
    /// Binds a context to a fixed location and identifier. `limit` is
    /// the payload capacity of the region.
    ///
    /// # Safety
    ///
    /// `ptr` must address at least `SIGN_SPACE + limit` mapped bytes,
    /// valid for the silo's lifetime.
    pub unsafe fn define(ptr: *mut u8, unique: u32, id: &str, limit: u64) -> Self {
        assert!(id.len() < 8);
        let mut idb = [0u8; 8];
        idb[..id.len()].copy_from_slice(id.as_bytes());
        Self {
            ptr,
            id: idb,
            unique,
            limit,
            ctx: Sha256::new(),
        }
    }

    fn hdr(&self, off: usize, len: usize) -> &[u8] {
        // SAFETY: within the header region per the define contract.
        unsafe { std::slice::from_raw_parts(self.ptr.add(off), len) }
    }

    fn hdr_mut(&mut self, off: usize, len: usize) -> &mut [u8] {
        // SAFETY: as above.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(off), len) }
    }

    /// Stored payload length.
    pub fn length(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.hdr(LEN_OFF, 8));
        u64::from_ne_bytes(b)
    }

    /// Start of the payload region.
    pub fn data_ptr(&self) -> *mut u8 {
        // SAFETY: payload begins right after the header.
        unsafe { self.ptr.add(SIGN_HDR_SIZE) }
    }

    /// The payload as a slice.
    pub fn data(&self) -> &[u8] {
        self.hdr(SIGN_HDR_SIZE, self.length() as usize)
    }

    /// Checks the signature; leaves the running hash ready for appends.
    /// Returns a small reason code on failure.
    pub fn check(&mut self) -> Result<(), u32> {
        if self.hdr(0, 8) != self.id {
            return Err(1);
        }
        let mut u = [0u8; 4];
        u.copy_from_slice(self.hdr(8, 4));
        if u32::from_ne_bytes(u) != self.unique {
            return Err(2);
        }
        let mut m = [0u8; 8];
        m.copy_from_slice(self.hdr(16, 8));
        let mapped = u64::from_ne_bytes(m);
        if mapped != self.ptr as u64 {
            debug!(
                id = %String::from_utf8_lossy(&self.id),
                stored = mapped,
                current = self.ptr as u64,
                "signature written under a different mapping"
            );
        }
        let length = self.length();
        if length > self.limit {
            // A torn or scribbled length; never dereference it.
            return Err(3);
        }
        let mut ctx = Sha256::new();
        ctx.update(self.hdr(0, LEN_OFF));
        ctx.update(self.hdr(SIGN_HDR_SIZE, length as usize));
        self.ctx = ctx.clone();
        ctx.update(length.to_ne_bytes());
        let digest = ctx.finalize();
        let stored = self.hdr(SIGN_HDR_SIZE + length as usize, SHA256_LEN);
        if digest.as_slice() != stored {
            return Err(4);
        }
        Ok(())
    }

    /// Resets the block to empty: restamps ident/unique/mapped, seeds the
    /// hash, writes a valid zero-length digest.
    pub fn reset(&mut self) {
        let id = self.id;
        let unique = self.unique;
        let mapped = self.ptr as u64;
        {
            let hdr = self.hdr_mut(0, SIGN_HDR_SIZE);
            hdr.fill(0);
            hdr[..8].copy_from_slice(&id);
            hdr[8..12].copy_from_slice(&unique.to_ne_bytes());
            hdr[16..24].copy_from_slice(&mapped.to_ne_bytes());
        }
        let mut ctx = Sha256::new();
        ctx.update(self.hdr(0, LEN_OFF));
        self.ctx = ctx;
        self.append(&[]);
    }

    /// Folds `data` into the signature: extends the payload hash, bumps
    /// `length`, rewrites the trailing digest.
    ///
    /// The payload bytes themselves must already be in place (or are
    /// appended here when `data` is non-empty).
    pub fn append(&mut self, data: &[u8]) {
        if !data.is_empty() {
            let length = self.length() as usize;
            self.hdr_mut(SIGN_HDR_SIZE + length, data.len())
                .copy_from_slice(data);
            self.ctx.update(data);
            let new_len = (length + data.len()) as u64;
            self.hdr_mut(LEN_OFF, 8).copy_from_slice(&new_len.to_ne_bytes());
        }
        let length = self.length();
        let mut ctx = self.ctx.clone();
        ctx.update(length.to_ne_bytes());
        let digest = ctx.finalize();
        self.hdr_mut(SIGN_HDR_SIZE + length as usize, SHA256_LEN)
            .copy_from_slice(&digest);
    }

    /// Extends the signature over `len` payload bytes already written in
    /// place behind the current length.
    pub fn append_in_place(&mut self, len: usize) {
        if len > 0 {
            let length = self.length() as usize;
            let payload = self.hdr(SIGN_HDR_SIZE + length, len).to_vec();
            self.ctx.update(&payload);
            let new_len = (length + len) as u64;
            self.hdr_mut(LEN_OFF, 8).copy_from_slice(&new_len.to_ne_bytes());
        }
        self.append(&[]);
    }

    /// msyncs the signed range to the backing store.
    pub fn sync(&self) {
        // SAFETY: msync of a page-aligned range covering the block.
        unsafe {
            let ps = libc::sysconf(libc::_SC_PAGESIZE).max(4096) as usize;
            let len = SIGN_HDR_SIZE + self.length() as usize + SHA256_LEN;
            let addr = self.ptr as usize;
            let start = addr & !(ps - 1);
            let end = addr + len;
            let _ = libc::msync(
                start as *mut libc::c_void,
                end - start,
                libc::MS_SYNC,
            );
        }
    }
}

/// A signed region with a fixed capacity: signature + payload space.
pub struct SignSpace {
    /// The signature context.
    pub ctx: SignCtx,
    /// Total region size, signature included.
    pub space: u64,
}

impl std::fmt::Debug for SignSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignSpace")
            .field("ctx", &self.ctx)
            .field("space", &self.space)
            .finish()
    }
}

impl SignSpace {
    /// Binds a signed region of `space` bytes at `ptr`.
    ///
    /// # Safety
    ///
    /// As [`SignCtx::define`], for the whole region.
    pub unsafe fn define(ptr: *mut u8, space: u64, unique: u32, id: &str) -> Self {
        // SAFETY: forwarded contract.
        let ctx = unsafe { SignCtx::define(ptr, unique, id, space - SIGN_SPACE) };
        Self { ctx, space }
    }

    /// Payload bytes still available.
    pub fn free(&self) -> u64 {
        self.space - SIGN_SPACE - self.ctx.length()
    }

    /// Appends payload bytes, failing when the region is full.
    pub fn append(&mut self, data: &[u8]) -> Result<(), ()> {
        if (self.free() as usize) < data.len() {
            return Err(());
        }
        self.ctx.append(data);
        Ok(())
    }

    /// Replaces the payload wholesale.
    pub fn replace(&mut self, data: &[u8]) {
        self.ctx.reset();
        assert!(self.free() as usize >= data.len());
        self.ctx.append(data);
        self.ctx.sync();
    }

    /// Copies another region's payload over this one.
    pub fn copy_from(&mut self, other: &SignSpace) {
        let payload = other.ctx.data().to_vec();
        self.ctx.reset();
        assert!(self.free() as usize >= payload.len());
        self.ctx.append(&payload);
    }
}
