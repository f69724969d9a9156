//! The SELF container format: file header and dense segment table.
//!
//! A SELF file is `SelfHeader` followed by `header.num_entries` contiguous
//! `SegmentHeader` records, followed directly by the embedded plain ELF
//! header and its program header table (see [`crate::elf`]).
//!
//! # Layout
//!
//! ```text
//! +------------------+
//! | SelfHeader (32B) |
//! +------------------+
//! | SegmentHeader[0] |  (32B each)
//! | SegmentHeader[1] |
//! | ...              |
//! +------------------+
//! | Elf64Header      |
//! | Elf64ProgramHeader[...] |
//! | 0x40 bytes (trailer, carried verbatim) |
//! +------------------+
//! ```

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::ProtoError;

/// PS4 fake-self / real-self container magic.
pub const SELF_MAGIC_PS4: u32 = 0x1D3D_154F;
/// PS5 ("Prospero") container magic.
pub const SELF_MAGIC_PS5: u32 = 0xEEF5_1454;

/// Default block window size (16 KiB), expressed as the shift applied to
/// `1 << (12 + block_bits)`.
pub const DEFAULT_BLOCK_SHIFT: u8 = 2;

/// Fixed-size SELF container header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct SelfHeader {
    magic: u32,
    version: u8,
    mode: u8,
    endian: u8,
    attrs: u8,
    key_type: u32,
    header_size: u16,
    meta_size: u16,
    file_size: u64,
    num_entries: u16,
    flags: u16,
    pad: [u8; 4],
}

impl SelfHeader {
    /// Size in bytes of the on-disk representation.
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Constructs a header for the fake-sign encoder.
    #[must_use]
    pub fn new(magic: u32, header_size: u16, meta_size: u16, num_entries: u16) -> Self {
        Self {
            magic,
            version: 0,
            mode: 1,
            endian: 1,
            attrs: 0x12,
            key_type: 0x101,
            header_size,
            meta_size,
            file_size: 0,
            num_entries,
            flags: 0x22,
            pad: [0; 4],
        }
    }

    /// Parses a header from the front of `buf`, validating the magic against
    /// either known platform magic.
    pub fn parse(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < Self::SIZE {
            return Err(ProtoError::Truncated {
                needed: Self::SIZE,
                got: buf.len(),
            });
        }
        let header =
            Self::read_from_bytes(&buf[..Self::SIZE]).map_err(|_| ProtoError::BadLayout("header alignment"))?;
        if header.magic() != SELF_MAGIC_PS4 && header.magic() != SELF_MAGIC_PS5 {
            return Err(ProtoError::BadMagic);
        }
        Ok(header)
    }

    /// Serializes the header to its on-disk bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }

    /// Container magic.
    #[must_use]
    pub fn magic(&self) -> u32 {
        self.magic
    }

    /// Size in bytes of the header plus segment table.
    #[must_use]
    pub fn header_size(&self) -> u16 {
        self.header_size
    }

    /// Size in bytes of the trailing metadata region (exinfo + npdrm + meta
    /// blocks + footer).
    #[must_use]
    pub fn meta_size(&self) -> u16 {
        self.meta_size
    }

    /// Number of segment-table entries. On the decode side this is the
    /// container's segment count; on the encode side it is `2 *
    /// eligible_phdr_count`.
    #[must_use]
    pub fn segment_count(&self) -> u16 {
        self.num_entries
    }

    /// Total file size recorded in the header (encode side only; decode side
    /// input files are not required to populate this field truthfully).
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Sets the total file size field (used by the encoder once layout is
    /// known).
    pub fn set_file_size(&mut self, size: u64) {
        self.file_size = size;
    }
}

/// A single entry in the SELF segment table.
///
/// The packed `props` word carries the per-entry flag bits described in the
/// container format: ordering/encryption/signing/compression flags, the
/// block-size shift, the block/digest/extents presence bits, and the segment
/// index this entry refers to.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct SegmentHeader {
    props: u64,
    offset: u64,
    compressed_size: u64,
    uncompressed_size: u64,
}

impl SegmentHeader {
    /// Size in bytes of the on-disk representation.
    pub const SIZE: usize = core::mem::size_of::<Self>();

    const BIT_IS_ORDERED: u64 = 1 << 0;
    const BIT_IS_ENCRYPTED: u64 = 1 << 1;
    const BIT_IS_SIGNED: u64 = 1 << 2;
    const BIT_IS_COMPRESSED: u64 = 1 << 3;
    const SHIFT_WINDOW_BITS: u32 = 8;
    const MASK_WINDOW_BITS: u64 = 0x7;
    const BIT_HAS_BLOCKS: u64 = 1 << 11;
    const SHIFT_BLOCK_BITS: u32 = 12;
    const MASK_BLOCK_BITS: u64 = 0xF;
    const BIT_HAS_DIGEST: u64 = 1 << 16;
    const BIT_HAS_EXTENTS: u64 = 1 << 17;
    const SHIFT_SEGMENT_INDEX: u32 = 20;
    const MASK_SEGMENT_INDEX: u64 = 0xFFFF;

    /// Builds a segment-table entry from the logical fields used by the
    /// fake-sign encoder.
    #[must_use]
    #[allow(clippy::fn_params_excessive_bools, clippy::too_many_arguments)]
    pub fn build(
        segment_index: u16,
        is_signed: bool,
        has_digest: bool,
        has_blocks: bool,
        block_bits: u8,
        offset: u64,
        compressed_size: u64,
        uncompressed_size: u64,
    ) -> Self {
        let mut props = 0u64;
        if is_signed {
            props |= Self::BIT_IS_SIGNED;
        }
        if has_digest {
            props |= Self::BIT_HAS_DIGEST;
        }
        if has_blocks {
            props |= Self::BIT_HAS_BLOCKS;
            props |= (u64::from(block_bits) & Self::MASK_BLOCK_BITS) << Self::SHIFT_BLOCK_BITS;
        }
        props |= (u64::from(segment_index) & Self::MASK_SEGMENT_INDEX) << Self::SHIFT_SEGMENT_INDEX;
        Self {
            props,
            offset,
            compressed_size,
            uncompressed_size,
        }
    }

    /// Parses one entry from the front of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < Self::SIZE {
            return Err(ProtoError::Truncated {
                needed: Self::SIZE,
                got: buf.len(),
            });
        }
        Self::read_from_bytes(&buf[..Self::SIZE]).map_err(|_| ProtoError::BadLayout("segment header alignment"))
    }

    /// Serializes the entry to its on-disk bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }

    fn props(&self) -> u64 {
        self.props
    }

    /// True if this entry is the ordered/canonical copy of its target.
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        self.props() & Self::BIT_IS_ORDERED != 0
    }

    /// True if the payload this entry describes is encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.props() & Self::BIT_IS_ENCRYPTED != 0
    }

    /// True if this entry carries a signature.
    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.props() & Self::BIT_IS_SIGNED != 0
    }

    /// True if the payload is compressed.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.props() & Self::BIT_IS_COMPRESSED != 0
    }

    /// Compression window size bits.
    #[must_use]
    pub fn window_bits(&self) -> u8 {
        ((self.props() >> Self::SHIFT_WINDOW_BITS) & Self::MASK_WINDOW_BITS) as u8
    }

    /// True if this entry describes a block-structured data segment.
    #[must_use]
    pub fn has_blocks(&self) -> bool {
        self.props() & Self::BIT_HAS_BLOCKS != 0
    }

    /// Raw block-size shift bits (`block_size = 1 << (12 + block_bits)`).
    #[must_use]
    pub fn block_bits(&self) -> u8 {
        ((self.props() >> Self::SHIFT_BLOCK_BITS) & Self::MASK_BLOCK_BITS) as u8
    }

    /// Resolved block window size in bytes (default 16 KiB when
    /// `block_bits == 2`).
    #[must_use]
    pub fn block_size(&self) -> u64 {
        1u64 << (12 + u32::from(self.block_bits()))
    }

    /// True if this is a block-info segment: its decrypted payload is a
    /// digest/extent table describing a different, data-carrying segment.
    #[must_use]
    pub fn has_block_info(&self) -> bool {
        self.props() & Self::BIT_HAS_EXTENTS != 0
    }

    /// True if block-info entries also carry a digest per block (interleaved
    /// digest+extent layout) rather than extents alone.
    #[must_use]
    pub fn has_digests(&self) -> bool {
        self.props() & Self::BIT_HAS_DIGEST != 0
    }

    /// Index into the segment table of the segment this entry targets.
    #[must_use]
    pub fn segment_id(&self) -> u16 {
        ((self.props() >> Self::SHIFT_SEGMENT_INDEX) & Self::MASK_SEGMENT_INDEX) as u16
    }

    /// Byte offset, within the file, of this segment's payload.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Compressed (on-disk) payload size in bytes.
    #[must_use]
    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    /// Decompressed (plaintext) payload size in bytes.
    #[must_use]
    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }
}

/// `0x20`-byte extended info block: authentication id, digest over the
/// plaintext ELF, and version fields. Written zero except `digest` by the
/// fake-sign encoder.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct ExInfo {
    authid: u64,
    kind: u64,
    app_version: u64,
    fw_version: u64,
    digest: [u8; 32],
}

impl ExInfo {
    /// Size in bytes of the on-disk representation.
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Fixed authentication id the fake-sign encoder stamps on every output.
    pub const FAKE_AUTHID: u64 = 0x3100_0000_0000_0002;

    /// Builds the `exinfo` block for a given plaintext-ELF digest.
    #[must_use]
    pub fn new(digest: [u8; 32]) -> Self {
        Self {
            authid: Self::FAKE_AUTHID,
            kind: 1,
            app_version: 0,
            fw_version: 0,
            digest,
        }
    }

    /// Serializes to bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }
}

/// `0x30`-byte NPDRM block. The encoder always writes `kind = 3` with the
/// remainder zeroed (no real DRM content id is produced).
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct NpdrmBlock {
    kind: u16,
    unknown: [u8; 0x0e],
    content_id: [u8; 0x13],
    random_pad: [u8; 0x0d],
}

impl NpdrmBlock {
    /// Size in bytes of the on-disk representation.
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Builds the fake-sign NPDRM block.
    #[must_use]
    pub fn fake() -> Self {
        Self {
            kind: 3,
            unknown: [0; 0x0e],
            content_id: [0; 0x13],
            random_pad: [0; 0x0d],
        }
    }

    /// Serializes to bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }
}

/// A single `0x50`-byte meta block. The encoder writes `num_entries` of
/// these, all zero.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Default)]
#[repr(C, packed)]
pub struct MetaBlock {
    unknown: [u8; 0x50],
}

impl MetaBlock {
    /// Size in bytes of the on-disk representation.
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Serializes to bytes (all zero).
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        self.as_bytes().try_into().unwrap_or([0; Self::SIZE])
    }
}

/// Trailing meta footer: `0x30` unknown bytes, a 4-byte `unknown1` field (the
/// only populated field; the encoder sets it to `0x10000`), `0x1c` more
/// unknown bytes, and a `0x100`-byte zero signature.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct MetaFooter {
    unknown0: [u8; 0x30],
    unknown1: u32,
    unknown2: [u8; 0x1c],
    signature: [u8; 0x100],
}

impl MetaFooter {
    /// Size in bytes of the on-disk representation.
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Builds the fake-sign meta footer. All undocumented regions are
    /// zeroed, as required.
    #[must_use]
    pub fn fake() -> Self {
        Self {
            unknown0: [0; 0x30],
            unknown1: 0x1_0000,
            unknown2: [0; 0x1c],
            signature: [0; 0x100],
        }
    }

    /// Serializes to bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }
}

/// Rounds `value` up to the next multiple of `align` (`align` must be a
/// power of two).
#[must_use]
pub fn align_up(value: u64, align: u64) -> u64 {
    (value + (align - 1)) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_header_size_is_32_bytes() {
        assert_eq!(SelfHeader::SIZE, 32);
    }

    #[test]
    fn segment_header_size_is_32_bytes() {
        assert_eq!(SegmentHeader::SIZE, 32);
    }

    #[test]
    fn self_header_round_trip() {
        let header = SelfHeader::new(SELF_MAGIC_PS5, 0x40, 0x180, 4);
        let bytes = header.to_bytes();
        let parsed = SelfHeader::parse(&bytes).expect("parse");
        assert_eq!(parsed.magic(), SELF_MAGIC_PS5);
        assert_eq!(parsed.header_size(), 0x40);
        assert_eq!(parsed.meta_size(), 0x180);
        assert_eq!(parsed.segment_count(), 4);
    }

    #[test]
    fn reject_bad_magic() {
        let header = SelfHeader::new(0xDEAD_BEEF, 0, 0, 0);
        let bytes = header.to_bytes();
        assert_eq!(SelfHeader::parse(&bytes), Err(ProtoError::BadMagic));
    }

    #[test]
    fn reject_truncated_header() {
        let bytes = [0u8; 10];
        assert!(matches!(
            SelfHeader::parse(&bytes),
            Err(ProtoError::Truncated { .. })
        ));
    }

    #[test]
    fn segment_header_block_size_default_is_16kib() {
        let seg = SegmentHeader::build(0, true, false, true, 2, 0, 0x3000, 0x3000);
        assert_eq!(seg.block_size(), 0x4000);
        assert!(seg.has_blocks());
        assert!(!seg.has_digests());
    }

    #[test]
    fn segment_header_flags_round_trip() {
        let seg = SegmentHeader::build(7, true, true, false, 0, 0x100, 0x20, 0x40);
        let bytes = seg.to_bytes();
        let parsed = SegmentHeader::parse(&bytes).expect("parse");
        assert_eq!(parsed.segment_id(), 7);
        assert!(parsed.is_signed());
        assert!(parsed.has_digests());
        assert!(!parsed.has_blocks());
        assert_eq!(parsed.offset(), 0x100);
        assert_eq!(parsed.compressed_size(), 0x20);
        assert_eq!(parsed.uncompressed_size(), 0x40);
    }

    #[test]
    fn align_up_rounds_to_16() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
    }
}
