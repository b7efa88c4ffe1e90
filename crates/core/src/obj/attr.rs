//! Object attribute and flag definitions.
//!
//! Attributes are typed, tagged metadata on a cached object. Fixed-size
//! attributes live at reserved offsets in the object's header chunk,
//! variable-size attributes grow into the header chunk's free area, and
//! auxiliary attributes own a separate storage allocation.

/// Attribute tags.
///
/// The discriminant doubles as the bit position in an objcore's
/// `oa_present` mask, so it must stay below 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjAttr {
    /// Body length, 8 bytes big-endian.
    Len = 0,
    /// Transaction id of the fetch, 4 bytes big-endian.
    Vxid = 1,
    /// Object flag byte, 1 byte.
    Flags = 2,
    /// Gzip bit offsets, 32 bytes.
    GzipBits = 3,
    /// Last-Modified timestamp, 8 bytes (double, BE-punned).
    LastModified = 4,
    /// Vary specification, variable size.
    Vary = 5,
    /// Stored response headers, variable size.
    Headers = 6,
    /// ESI parse data, auxiliary (own storage allocation).
    EsiData = 7,
}

impl ObjAttr {
    /// Size of a fixed attribute, `None` for variable/auxiliary ones.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            ObjAttr::Len => Some(8),
            ObjAttr::Vxid => Some(4),
            ObjAttr::Flags => Some(1),
            ObjAttr::GzipBits => Some(32),
            ObjAttr::LastModified => Some(8),
            ObjAttr::Vary | ObjAttr::Headers | ObjAttr::EsiData => None,
        }
    }

    /// Byte offset of a fixed attribute within the header chunk's fixed
    /// area, `None` for variable/auxiliary ones.
    pub fn fixed_offset(self) -> Option<usize> {
        match self {
            ObjAttr::Len => Some(0),
            ObjAttr::Vxid => Some(8),
            ObjAttr::Flags => Some(12),
            ObjAttr::GzipBits => Some(13),
            ObjAttr::LastModified => Some(45),
            ObjAttr::Vary | ObjAttr::Headers | ObjAttr::EsiData => None,
        }
    }

    /// Bit in the `oa_present` mask.
    pub fn present_bit(self) -> u32 {
        1 << (self as u8)
    }

    /// True for the variable-size attributes stored in the header chunk.
    pub fn is_variable(self) -> bool {
        matches!(self, ObjAttr::Vary | ObjAttr::Headers)
    }
}

/// Total bytes of the fixed attribute area (LEN + VXID + FLAGS + GZIPBITS
/// + LASTMODIFIED), rounded up for alignment of what follows.
pub const FIXED_ATTR_AREA: usize = 64;

/// Object flags, stored in the [`ObjAttr::Flags`] attribute byte.
pub mod obj_flags {
    /// Body is gzip compressed.
    pub const GZIPED: u8 = 1 << 1;
    /// Compression state was changed relative to the backend response.
    pub const CHGGZIP: u8 = 1 << 2;
    /// Object is a candidate for If-Modified-Since handling.
    pub const IMSCAND: u8 = 1 << 3;
    /// Object requires ESI processing on delivery.
    pub const ESIPROC: u8 = 1 << 4;
}

/// Objcore flags, the `flags` bitfield on a cache entry.
pub mod oc_flags {
    /// Object is being fetched; a busy-object core is attached.
    pub const BUSY: u32 = 1 << 0;
    /// Hit-for-miss marker.
    pub const HFM: u32 = 1 << 1;
    /// Hit-for-pass marker.
    pub const HFP: u32 = 1 << 2;
    /// Upstream abandoned the fetch; the fetcher should stop.
    pub const CANCEL: u32 = 1 << 3;
    /// Object is being dismantled and must not gain references.
    pub const DYING: u32 = 1 << 4;
    /// Object lives in transient storage and is never cached.
    pub const TRANSIENT: u32 = 1 << 5;
    /// Object is private to one request.
    pub const PRIVATE: u32 = 1 << 6;
}
