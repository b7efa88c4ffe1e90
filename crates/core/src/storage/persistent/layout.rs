//! On-disk layout of a persistent silo.
//!
//! Overall layout:
//!
//! ```text
//! [ IDENT + signature ]
//! [ BAN1 + signature ][ BAN2 + signature ]    ban journal, double buffer
//! [ SEG1 + signature ][ SEG2 + signature ]    segment table, double buffer
//! [ SPC region ]                              segments live here
//! [ END ]
//! ```
//!
//! All multi-byte fields are stored native-endian; the identification
//! block carries a byte-order sentinel so a foreign-endian silo is
//! rejected instead of misread. Object and chunk records address silo
//! contents by byte offset, never by pointer, so a silo remapped at a
//! different address (or on a different run) needs no pointer patching.

/// Human-readable identification string at the head of every silo.
pub const IDENT_STRING: &str = "Varnish Persistent Storage Silo";

/// Byte-order sentinel stored in the identification block.
pub const BYTE_ORDER: u32 = 0x1234_5678;

/// Major version of the on-disk format.
pub const MAJOR_VERSION: u32 = 2;

/// Size of the identification payload.
pub const IDENT_SIZE: usize = 120;

/// `stuff[]` slot indices.
pub const STUFF_BAN1: usize = 0;
/// Second ban journal slot.
pub const STUFF_BAN2: usize = 1;
/// First segment table slot.
pub const STUFF_SEG1: usize = 2;
/// Second segment table slot.
pub const STUFF_SEG2: usize = 3;
/// Start of the segment payload region.
pub const STUFF_SPC: usize = 4;
/// End of the silo.
pub const STUFF_END: usize = 5;

/// Size of a signature header (ident, unique, mapped, length).
pub const SIGN_HDR_SIZE: usize = 32;
/// SHA-256 digest length.
pub const SHA256_LEN: usize = 32;
/// Total reserved footprint of one signature (header + digest).
pub const SIGN_SPACE: u64 = (SIGN_HDR_SIZE + SHA256_LEN) as u64;

/// On-disk segment pointer record size (offset, length, objlist,
/// lobjlist, pad).
pub const SEGPTR_SIZE: usize = 32;

/// On-disk object record size (hash, expiry, ban, ptr, len).
pub const SMP_OBJECT_SIZE: usize = 64;

/// On-disk chunk header size (magic, flags, len, space, next).
pub const DISK_CHUNK_SIZE: usize = 32;
/// Chunk header magic.
pub const DISK_CHUNK_MAGIC: u32 = 0x5143_6b68;

/// On-disk object head size (attribute directory + body chain).
pub const DISK_OBJHEAD_SIZE: usize = 48;
/// Object head magic.
pub const DISK_OBJHEAD_MAGIC: u32 = 0x4f48_6430;

/// The parsed identification block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiloIdent {
    /// Random identity stamped at creation, echoed in every signature.
    pub unique: u32,
    /// Total silo size in bytes.
    pub mediasize: u64,
    /// Smallest addressing unit (at least the page size).
    pub granularity: u32,
    /// Pointer alignment for in-silo records.
    pub align: u32,
    /// Region offsets; see the `STUFF_*` indices.
    pub stuff: [u64; 6],
}

/// Serializes the identification payload.
pub fn write_ident(buf: &mut [u8], id: &SiloIdent) {
    assert!(buf.len() >= IDENT_SIZE);
    buf[..IDENT_SIZE].fill(0);
    let s = IDENT_STRING.as_bytes();
    buf[..s.len()].copy_from_slice(s);
    buf[32..36].copy_from_slice(&BYTE_ORDER.to_ne_bytes());
    buf[36..40].copy_from_slice(&(IDENT_SIZE as u32).to_ne_bytes());
    buf[40..44].copy_from_slice(&MAJOR_VERSION.to_ne_bytes());
    // 44..48 minor version, zero.
    buf[48..52].copy_from_slice(&id.unique.to_ne_bytes());
    buf[52..56].copy_from_slice(&id.granularity.to_ne_bytes());
    buf[56..64].copy_from_slice(&id.mediasize.to_ne_bytes());
    buf[64..68].copy_from_slice(&id.align.to_ne_bytes());
    for (i, v) in id.stuff.iter().enumerate() {
        let o = 72 + i * 8;
        buf[o..o + 8].copy_from_slice(&v.to_ne_bytes());
    }
}

/// Parses and validates the identification payload. The error code is a
/// small reason number for diagnostics.
pub fn read_ident(buf: &[u8], mediasize: u64) -> Result<SiloIdent, u32> {
    if buf.len() < IDENT_SIZE {
        return Err(1);
    }
    let s = IDENT_STRING.as_bytes();
    if &buf[..s.len()] != s || buf[s.len()] != 0 {
        return Err(2);
    }
    let rd32 = |o: usize| {
        let mut b = [0u8; 4];
        b.copy_from_slice(&buf[o..o + 4]);
        u32::from_ne_bytes(b)
    };
    let rd64 = |o: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf[o..o + 8]);
        u64::from_ne_bytes(b)
    };
    if rd32(32) != BYTE_ORDER {
        return Err(3);
    }
    if rd32(36) != IDENT_SIZE as u32 {
        return Err(4);
    }
    if rd32(40) != MAJOR_VERSION {
        return Err(5);
    }
    let id = SiloIdent {
        unique: rd32(48),
        granularity: rd32(52),
        mediasize: rd64(56),
        align: rd32(64),
        stuff: [
            rd64(72),
            rd64(80),
            rd64(88),
            rd64(96),
            rd64(104),
            rd64(112),
        ],
    };
    if id.mediasize != mediasize {
        return Err(7);
    }
    if id.granularity == 0 {
        return Err(8);
    }
    if (id.align as usize) < size_of::<*const u8>() || !id.align.is_power_of_two() {
        return Err(9);
    }
    Ok(id)
}

/// An on-disk segment pointer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegPtr {
    /// Byte offset of the segment within the silo.
    pub offset: u64,
    /// Segment length in bytes.
    pub length: u64,
    /// Offset of the object record array (0 until the segment closes).
    pub objlist: u64,
    /// Number of object records ever allocated in the segment.
    pub lobjlist: u32,
}

impl SegPtr {
    /// Serializes the record.
    pub fn write(&self, buf: &mut [u8]) {
        assert!(buf.len() >= SEGPTR_SIZE);
        buf[..8].copy_from_slice(&self.offset.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.length.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.objlist.to_ne_bytes());
        buf[24..28].copy_from_slice(&self.lobjlist.to_ne_bytes());
        buf[28..32].fill(0);
    }

    /// Deserializes the record.
    pub fn read(buf: &[u8]) -> Self {
        assert!(buf.len() >= SEGPTR_SIZE);
        let rd64 = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[o..o + 8]);
            u64::from_ne_bytes(b)
        };
        let mut l = [0u8; 4];
        l.copy_from_slice(&buf[24..28]);
        Self {
            offset: rd64(0),
            length: rd64(8),
            objlist: rd64(16),
            lobjlist: u32::from_ne_bytes(l),
        }
    }
}

/// An on-disk object record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmpObject {
    /// Cache-key digest of the object.
    pub hash: [u8; 32],
    /// Absolute expiry; a negative value means the tail of the period is
    /// grace.
    pub expiry: f64,
    /// Ban timestamp the object was last evaluated against.
    pub ban: f64,
    /// Silo offset of the object's header chunk record; 0 when freed.
    pub ptr: u64,
    /// Total allocation length, for madvise-style hints.
    pub len: u64,
}

impl SmpObject {
    /// A harmless record: already expired, nothing referenced.
    pub fn zero() -> Self {
        Self {
            hash: [0; 32],
            expiry: 0.0,
            ban: 0.0,
            ptr: 0,
            len: 0,
        }
    }

    /// Absolute expiry time regardless of the grace encoding.
    pub fn when(&self) -> f64 {
        self.expiry.abs()
    }

    /// Serializes the record.
    pub fn write(&self, buf: &mut [u8]) {
        assert!(buf.len() >= SMP_OBJECT_SIZE);
        buf[..32].copy_from_slice(&self.hash);
        buf[32..40].copy_from_slice(&self.expiry.to_ne_bytes());
        buf[40..48].copy_from_slice(&self.ban.to_ne_bytes());
        buf[48..56].copy_from_slice(&self.ptr.to_ne_bytes());
        buf[56..64].copy_from_slice(&self.len.to_ne_bytes());
    }

    /// Deserializes the record.
    pub fn read(buf: &[u8]) -> Self {
        assert!(buf.len() >= SMP_OBJECT_SIZE);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&buf[..32]);
        let rdf = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[o..o + 8]);
            f64::from_ne_bytes(b)
        };
        let rd64 = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[o..o + 8]);
            u64::from_ne_bytes(b)
        };
        Self {
            hash,
            expiry: rdf(32),
            ban: rdf(40),
            ptr: rd64(48),
            len: rd64(56),
        }
    }
}

// ---------------------------------------------------------------------
// Raw accessors for in-mapping records.
//
// These run against the silo mapping; callers guarantee the pointers
// address the records they claim to.

/// Writes a fresh chunk header.
///
/// # Safety
///
/// `hdr` must address [`DISK_CHUNK_SIZE`] writable bytes in the mapping.
pub unsafe fn chunk_init(hdr: *mut u8, space: u64) {
    // SAFETY: caller contract.
    unsafe {
        (hdr as *mut u32).write_unaligned(DISK_CHUNK_MAGIC);
        (hdr.add(4) as *mut u32).write_unaligned(0);
        (hdr.add(8) as *mut u64).write_unaligned(0); // len
        (hdr.add(16) as *mut u64).write_unaligned(space);
        (hdr.add(24) as *mut u64).write_unaligned(0); // next
    }
}

/// Reads (magic, len, space, next) from a chunk header.
///
/// # Safety
///
/// `hdr` must address [`DISK_CHUNK_SIZE`] readable bytes in the mapping.
pub unsafe fn chunk_read(hdr: *const u8) -> (u32, u64, u64, u64) {
    // SAFETY: caller contract.
    unsafe {
        (
            (hdr as *const u32).read_unaligned(),
            (hdr.add(8) as *const u64).read_unaligned(),
            (hdr.add(16) as *const u64).read_unaligned(),
            (hdr.add(24) as *const u64).read_unaligned(),
        )
    }
}

/// Links a chunk to its successor in the body chain.
///
/// # Safety
///
/// `hdr` must address a chunk header in the mapping.
pub unsafe fn chunk_set_next(hdr: *mut u8, next_off: u64) {
    // SAFETY: caller contract.
    unsafe { (hdr.add(24) as *mut u64).write_unaligned(next_off) };
}

/// Writes a fresh object head.
///
/// # Safety
///
/// `head` must address [`DISK_OBJHEAD_SIZE`] writable bytes.
pub unsafe fn objhead_init(head: *mut u8) {
    // SAFETY: caller contract.
    unsafe {
        std::ptr::write_bytes(head, 0, DISK_OBJHEAD_SIZE);
        (head as *mut u32).write_unaligned(DISK_OBJHEAD_MAGIC);
    }
}

/// Records a variable attribute (0 = vary, 1 = headers).
///
/// # Safety
///
/// `head` must address an object head in the mapping.
pub unsafe fn objhead_set_va(head: *mut u8, idx: usize, off: u32, len: u32) {
    assert!(idx < 2);
    let base = 8 + idx * 8;
    // SAFETY: caller contract.
    unsafe {
        (head.add(base) as *mut u32).write_unaligned(off);
        (head.add(base + 4) as *mut u32).write_unaligned(len);
    }
}

/// Records the auxiliary ESI data chunk offset.
///
/// # Safety
///
/// `head` must address an object head in the mapping.
pub unsafe fn objhead_set_esidata(head: *mut u8, off: u64) {
    // SAFETY: caller contract.
    unsafe { (head.add(24) as *mut u64).write_unaligned(off) };
}

/// Records the first chunk of the body chain.
///
/// # Safety
///
/// `head` must address an object head in the mapping.
pub unsafe fn objhead_set_body_head(head: *mut u8, off: u64) {
    // SAFETY: caller contract.
    unsafe { (head.add(32) as *mut u64).write_unaligned(off) };
}

/// Records the last chunk of the body chain.
///
/// # Safety
///
/// `head` must address an object head in the mapping.
pub unsafe fn objhead_set_body_tail(head: *mut u8, off: u64) {
    // SAFETY: caller contract.
    unsafe { (head.add(40) as *mut u64).write_unaligned(off) };
}

/// Reads an object head: (magic, [vary, headers], esidata, body_head).
///
/// # Safety
///
/// `head` must address an object head in the mapping.
pub unsafe fn objhead_read(
    head: *const u8,
) -> (u32, [(u32, u32); 2], u64, u64) {
    // SAFETY: caller contract.
    unsafe {
        let rd32 = |o: usize| (head.add(o) as *const u32).read_unaligned();
        let rd64 = |o: usize| (head.add(o) as *const u64).read_unaligned();
        (
            rd32(0),
            [(rd32(8), rd32(12)), (rd32(16), rd32(20))],
            rd64(24),
            rd64(32),
        )
    }
}
