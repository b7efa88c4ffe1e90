//! Body storage chunks.
//!
//! A chunk is one contiguous span of body storage: a pointer, the bytes
//! written so far (`len`) and the bytes available (`space`). Chunks are
//! handed out by a stevedore's allocator and linked into an object's body
//! list by the simple-storage layer.
//!
//! The pointer may address heap memory, a window of an mmap'd file, or a
//! range inside a persistent silo. Silo-backed chunks write their length
//! through to the on-disk chunk header so a crash can recover the body.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Where a chunk's memory comes from; determines cleanup and write-through.
#[derive(Clone, Copy)]
pub enum Backing {
    /// Heap allocation owned by the chunk (freed on drop).
    Heap,
    /// Extent of an mmap'd file; `offset` identifies it to the free list.
    Mapped {
        /// Byte offset of the extent within the file.
        offset: u64,
    },
    /// Range inside a persistent silo. `hdr` points at the on-disk chunk
    /// header; length updates are written through.
    Silo {
        /// Location of the on-disk chunk header in the silo mapping.
        hdr: *mut u8,
        /// Silo offset of the header, for recovery records.
        off: u64,
    },
}

/// Flag: the chunk is a scratch buffer, not part of a body.
pub const CHUNK_F_BUFFER: u32 = 1 << 0;

/// Offset of the `len` field inside an on-disk silo chunk header.
/// Mirrors `persistent::layout::DiskChunk`.
const SILO_HDR_LEN_OFF: usize = 8;

/// One span of body storage.
pub struct Chunk {
    ptr: *mut u8,
    space: usize,
    len: AtomicUsize,
    flags: AtomicU32,
    backing: Backing,
}

// SAFETY: the pointer is either owned (heap) or points into a mapping that
// outlives every chunk handed out from it (the stevedore keeps the mapping
// for its own lifetime). Writes are confined to the fetch thread; readers
// only access bytes below the committed watermark.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("len", &self.len())
            .field("space", &self.space)
            .field("buffer", &(self.flags() & CHUNK_F_BUFFER != 0))
            .finish()
    }
}

impl Chunk {
    /// Allocates a zeroed heap chunk of `space` bytes.
    pub fn new_heap(space: usize) -> Self {
        assert!(space > 0);
        let mut vec = vec![0u8; space];
        let ptr = vec.as_mut_ptr();
        std::mem::forget(vec);
        Self {
            ptr,
            space,
            len: AtomicUsize::new(0),
            flags: AtomicU32::new(0),
            backing: Backing::Heap,
        }
    }

    /// Wraps externally managed memory (file extent, silo range).
    ///
    /// # Safety
    ///
    /// `ptr` must point at `space` writable bytes that stay valid and
    /// unaliased-for-write until the owning stevedore reclaims them.
    pub unsafe fn from_raw(ptr: *mut u8, space: usize, backing: Backing) -> Self {
        assert!(space > 0);
        Self {
            ptr,
            space,
            len: AtomicUsize::new(0),
            flags: AtomicU32::new(0),
            backing,
        }
    }

    /// Bytes available in this chunk.
    pub fn space(&self) -> usize {
        self.space
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// True when nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw base pointer.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Sets the committed length, writing through to the silo header when
    /// the chunk is silo-backed.
    pub fn set_len(&self, len: usize) {
        assert!(len <= self.space);
        self.len.store(len, Ordering::Release);
        if let Backing::Silo { hdr, .. } = self.backing {
            // SAFETY: hdr addresses the on-disk chunk header inside the
            // silo mapping, which outlives the chunk.
            unsafe {
                let p = hdr.add(SILO_HDR_LEN_OFF) as *mut u64;
                p.write_unaligned(len as u64);
            }
        }
    }

    /// Advances the committed length by `l`.
    pub fn add_len(&self, l: usize) {
        self.set_len(self.len() + l);
    }

    /// Chunk flags.
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    /// Marks the chunk as a scratch buffer.
    pub fn mark_buffer(&self) {
        let _ = self.flags.fetch_or(CHUNK_F_BUFFER, Ordering::Relaxed);
    }

    /// The chunk's backing description.
    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// Copies `data` into the chunk at byte offset `off`.
    pub fn write_at(&self, off: usize, data: &[u8]) {
        assert!(off + data.len() <= self.space, "chunk write out of bounds");
        // SAFETY: bounds asserted above; only the fetch thread writes.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(off), data.len());
        }
    }

    /// Reads `len` bytes starting at `off`.
    ///
    /// # Safety
    ///
    /// The caller must ensure the range is below the committed watermark
    /// it has observed (via the BOC or a finished body), so no concurrent
    /// writes overlap it.
    pub unsafe fn slice(&self, off: usize, len: usize) -> &[u8] {
        assert!(off + len <= self.space, "chunk read out of bounds");
        // SAFETY: bounds asserted; aliasing contract is on the caller.
        unsafe { std::slice::from_raw_parts(self.ptr.add(off), len) }
    }

    /// Raw (pointer, length) for lease vectors.
    pub(crate) fn region(&self, off: usize, len: usize) -> (*const u8, usize) {
        assert!(off + len <= self.space);
        // SAFETY: in-bounds pointer arithmetic within one allocation.
        (unsafe { self.ptr.add(off) as *const u8 }, len)
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // Mapped and silo chunks reference memory their stevedore owns.
        if matches!(self.backing, Backing::Heap) {
            // SAFETY: reconstructs the Vec forgotten in new_heap with its
            // original length and capacity.
            unsafe {
                let _ = Vec::from_raw_parts(self.ptr, self.space, self.space);
            }
        }
    }
}

/// A writable body region handed out by `objgetspace`.
///
/// Wraps the tail of the current body chunk. The fetcher copies bytes in
/// and then commits them with `extend`.
pub struct BodySpace {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the region stays valid until the commit; only the fetch thread
// holds a BodySpace.
unsafe impl Send for BodySpace {}

impl std::fmt::Debug for BodySpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodySpace").field("len", &self.len).finish()
    }
}

impl BodySpace {
    /// Wraps a raw writable region.
    pub(crate) fn new(ptr: *mut u8, len: usize) -> Self {
        assert!(len > 0);
        Self { ptr, len }
    }

    /// Bytes available in the region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; the region is at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Copies `data` to the start of the region.
    pub fn write(&self, data: &[u8]) {
        assert!(data.len() <= self.len, "body write exceeds reserved space");
        // SAFETY: bounds asserted above.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr, data.len());
        }
    }

    /// Raw pointer for callers that produce bytes in place.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }
}
