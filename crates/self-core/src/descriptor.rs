//! The per-file, arena-lived descriptor graph produced by the Segment
//! Decryptor and consumed by the Block Decryptor.
//!
//! Strictly tree-shaped: a [`BlockSegment`] owns its `digests` and
//! `extents`; nothing points back. No cycles, so plain owned `Vec`s are
//! sufficient for correctness — but the extent table itself is built inside
//! the bump arena (`self_core::arena`) first, bounding peak memory for the
//! per-file scratch the synthesized case needs, before being copied into the
//! owned `Vec` this module hands back.

use crate::arena::{self, BumpArena};

/// A contiguous byte range within a data segment's decrypted payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Byte offset within the segment's decrypted payload.
    pub offset: u64,
    /// Length in bytes of this block (constant except for the last block of
    /// a segment).
    pub len: u64,
}

/// The decoded digest/extent table for a data-carrying segment, recovered
/// either from a block-info segment's decrypted payload or synthesized when
/// no block-info segment is present.
pub struct BlockSegment {
    /// Decrypted payload bytes of the target segment (filled in by the
    /// Block Decryptor, block by block).
    pub data: Vec<u8>,
    /// Total decrypted size in bytes.
    pub size: u64,
    /// Number of blocks.
    pub block_count: usize,
    /// Per-block SHA-256 digest, when the segment carries digests
    /// (`has_digests`). Empty when absent.
    pub digests: Vec<[u8; 32]>,
    /// Per-block extent (offset + length) within the decrypted payload.
    pub extents: Vec<Extent>,
}

/// Bytes an extent record occupies in the arena's scratch table: one `u64`
/// offset followed by one `u64` length.
const EXTENT_RECORD_SIZE: usize = 16;

impl BlockSegment {
    /// Builds a descriptor for a segment with `block_count` blocks of
    /// `block_size` bytes each (with a possibly-shorter tail block), and no
    /// digest table — the synthesized case used when no block-info segment
    /// describes this target.
    ///
    /// The extent table is built inside `arena` before being copied into the
    /// returned descriptor's owned `Vec`; returns `None` if `arena` doesn't
    /// have room, which callers turn into `SelfError::Internal` and abort
    /// the current file.
    pub fn synthesize(arena: &mut BumpArena, uncompressed_size: u64, block_size: u64) -> Option<Self> {
        let block_count = uncompressed_size.div_ceil(block_size).max(1) as usize;
        let handle = arena.calloc(block_count, EXTENT_RECORD_SIZE)?;

        let mut extents = Vec::with_capacity(block_count);
        for i in 0..block_count {
            let offset = i as u64 * block_size;
            let remaining = uncompressed_size.saturating_sub(offset);
            let len = if remaining == 0 || remaining >= block_size {
                block_size
            } else {
                remaining
            };
            let record_start = i * EXTENT_RECORD_SIZE;
            let record = &mut arena.get_mut(&handle)[record_start..record_start + EXTENT_RECORD_SIZE];
            record[0..8].copy_from_slice(&offset.to_le_bytes());
            record[8..16].copy_from_slice(&len.to_le_bytes());
            extents.push(Extent { offset, len });
        }
        Some(Self {
            data: vec![0u8; uncompressed_size as usize],
            size: uncompressed_size,
            block_count,
            digests: Vec::new(),
            extents,
        })
    }

    /// Copies `plaintext` into this segment's output buffer at `extent`'s
    /// offset, writing `min(extent.len, plaintext.len())` bytes — the
    /// service's response isn't guaranteed to be exactly `extent.len` bytes
    /// long (the service transport may round block reads up to a fixed page
    /// count), so this never assumes `plaintext` covers the whole extent.
    ///
    /// # Panics
    ///
    /// Panics if `extent` falls outside `self.data`; callers derive extents
    /// from this same segment so this is an internal invariant, not a
    /// user-facing failure mode.
    pub fn place_block(&mut self, extent: Extent, plaintext: &[u8]) {
        let start = extent.offset as usize;
        let len = (extent.len as usize).min(plaintext.len());
        self.data[start..start + len].copy_from_slice(&plaintext[..len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesize_full_blocks_only() {
        let mut arena = BumpArena::new(arena::DEFAULT_ARENA_CAPACITY);
        let seg = BlockSegment::synthesize(&mut arena, 0x8000, 0x4000).expect("synthesize");
        assert_eq!(seg.block_count, 2);
        assert_eq!(seg.extents[0], Extent { offset: 0, len: 0x4000 });
        assert_eq!(
            seg.extents[1],
            Extent {
                offset: 0x4000,
                len: 0x4000
            }
        );
    }

    #[test]
    fn synthesize_short_tail_block() {
        let mut arena = BumpArena::new(arena::DEFAULT_ARENA_CAPACITY);
        let seg = BlockSegment::synthesize(&mut arena, 0x3000, 0x4000).expect("synthesize");
        assert_eq!(seg.block_count, 1);
        assert_eq!(seg.extents[0], Extent { offset: 0, len: 0x3000 });
    }

    #[test]
    fn synthesize_exact_multiple_has_no_short_tail() {
        let mut arena = BumpArena::new(arena::DEFAULT_ARENA_CAPACITY);
        let seg = BlockSegment::synthesize(&mut arena, 0x4000, 0x4000).expect("synthesize");
        assert_eq!(seg.block_count, 1);
        assert_eq!(seg.extents[0].len, 0x4000);
    }

    #[test]
    fn synthesize_fails_cleanly_when_arena_is_too_small() {
        let mut arena = BumpArena::new(4);
        assert!(BlockSegment::synthesize(&mut arena, 0x8000, 0x4000).is_none());
    }

    #[test]
    fn place_block_writes_at_extent_offset() {
        let mut arena = BumpArena::new(arena::DEFAULT_ARENA_CAPACITY);
        let mut seg = BlockSegment::synthesize(&mut arena, 8, 4).expect("synthesize");
        seg.place_block(Extent { offset: 4, len: 4 }, &[9, 9, 9, 9]);
        assert_eq!(&seg.data[4..8], &[9, 9, 9, 9]);
    }
}
