//! Segment Decryptor: resolves every block-info segment to the digest/extent
//! table describing its target data segment.
//!
//! A block-info segment's own decrypted payload is never user-visible data —
//! it is a table of per-block digests and/or extents describing a different,
//! data-carrying segment (`segment_id()` names the target). The Block
//! Decryptor consumes the [`BlockSegment`] this module produces; it never
//! touches a block-info segment's ciphertext directly.

use std::path::Path;
use std::time::Duration;

use self_core::arena::BumpArena;
use self_core::descriptor::{BlockSegment, Extent};
use self_core::{Environment, SelfError};
use self_kernel::DecryptService;
use self_proto::self_format::SegmentHeader;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

const DIGEST_EXTENT_RECORD_SIZE: u64 = 0x20 + 0x8;
const EXTENT_ONLY_RECORD_SIZE: u64 = 0x8;

/// Bytes the arena scratch table reserves per block: one digest slot (32
/// bytes, zero-length when the block-info segment carries no digests) plus
/// one extent record (16 bytes: offset + length as `u64`s).
const DIGEST_SLOT_SIZE: usize = 32;
const EXTENT_SLOT_SIZE: usize = 16;

/// Decrypts the block-info segment at `segment_index` and decodes its
/// payload into a [`BlockSegment`] describing `target`.
///
/// The digest/extent table is built inside `arena` — the "segment records,
/// block records, digest slots" scratch the bump arena exists for — before
/// being copied into the descriptor's owned `Vec`s.
pub fn decrypt_block_info<D: DecryptService, E: Environment>(
    path: &Path,
    service: &D,
    env: &E,
    arena: &mut BumpArena,
    segment_index: u16,
    block_info: &SegmentHeader,
    ciphertext: &[u8],
    target: &SegmentHeader,
) -> Result<BlockSegment, SelfError> {
    let plaintext = load_with_retry(path, service, env, segment_index, ciphertext, block_info.uncompressed_size())?;

    let record_size = if block_info.has_digests() {
        DIGEST_EXTENT_RECORD_SIZE
    } else {
        EXTENT_ONLY_RECORD_SIZE
    };
    let block_count = (plaintext.len() as u64 / record_size) as usize;

    let has_digests = block_info.has_digests();
    let digest_handle = arena
        .calloc(block_count, if has_digests { DIGEST_SLOT_SIZE } else { 0 })
        .ok_or_else(|| arena_exhausted(path, segment_index))?;
    let extent_handle = arena.calloc(block_count, EXTENT_SLOT_SIZE).ok_or_else(|| arena_exhausted(path, segment_index))?;

    let mut running_offset = 0u64;
    for i in 0..block_count {
        let record_start = i * record_size as usize;
        let len = if has_digests {
            let digest_start = record_start;
            let slot_start = i * DIGEST_SLOT_SIZE;
            arena.get_mut(&digest_handle)[slot_start..slot_start + 32].copy_from_slice(&plaintext[digest_start..digest_start + 32]);
            read_u64_le(&plaintext[digest_start + 32..digest_start + 40])
        } else {
            read_u64_le(&plaintext[record_start..record_start + 8])
        };

        let slot_start = i * EXTENT_SLOT_SIZE;
        let record = &mut arena.get_mut(&extent_handle)[slot_start..slot_start + EXTENT_SLOT_SIZE];
        record[0..8].copy_from_slice(&running_offset.to_le_bytes());
        record[8..16].copy_from_slice(&len.to_le_bytes());
        running_offset += len;
    }

    let mut digests = Vec::with_capacity(if has_digests { block_count } else { 0 });
    let mut extents = Vec::with_capacity(block_count);
    for i in 0..block_count {
        if has_digests {
            let slot_start = i * DIGEST_SLOT_SIZE;
            let mut digest = [0u8; 32];
            digest.copy_from_slice(&arena.get(&digest_handle)[slot_start..slot_start + 32]);
            digests.push(digest);
        }
        let slot_start = i * EXTENT_SLOT_SIZE;
        let record = &arena.get(&extent_handle)[slot_start..slot_start + EXTENT_SLOT_SIZE];
        let mut offset_bytes = [0u8; 8];
        offset_bytes.copy_from_slice(&record[0..8]);
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&record[8..16]);
        extents.push(Extent {
            offset: u64::from_le_bytes(offset_bytes),
            len: u64::from_le_bytes(len_bytes),
        });
    }

    Ok(BlockSegment {
        data: vec![0u8; target.uncompressed_size() as usize],
        size: target.uncompressed_size(),
        block_count,
        digests,
        extents,
    })
}

fn arena_exhausted(path: &Path, segment_index: u16) -> SelfError {
    SelfError::Internal {
        path: path.to_path_buf(),
        reason: format!("bump arena exhausted decoding block-info segment {segment_index}"),
    }
}

fn load_with_retry<D: DecryptService, E: Environment>(
    path: &Path,
    service: &D,
    env: &E,
    segment_index: u16,
    ciphertext: &[u8],
    uncompressed_size: u64,
) -> Result<Vec<u8>, SelfError> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match service.load_self_segment(ciphertext, uncompressed_size) {
            Ok(plaintext) => return Ok(plaintext),
            Err(err) if attempts < MAX_ATTEMPTS => {
                tracing::warn!(path = %path.display(), segment_index, attempt = attempts, %err, "segment decrypt failed, retrying");
                env.sleep(RETRY_INTERVAL);
            },
            Err(_) => {
                return Err(SelfError::SegmentDecrypt {
                    path: path.to_path_buf(),
                    segment_index,
                    attempts,
                });
            },
        }
    }
}

fn read_u64_le(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::time::Instant;

    use self_kernel::KernelError;

    use super::*;

    #[derive(Clone, Default)]
    struct NoSleepEnv;

    impl Environment for NoSleepEnv {
        type Instant = Instant;
        fn now(&self) -> Instant {
            Instant::now()
        }
        fn sleep(&self, _duration: Duration) {}
    }

    struct FixedService {
        response: Vec<u8>,
        fail_until: RefCell<u32>,
    }

    impl DecryptService for FixedService {
        fn load_self_segment(&self, _ciphertext: &[u8], _uncompressed_size: u64) -> Result<Vec<u8>, KernelError> {
            let mut remaining = self.fail_until.borrow_mut();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(KernelError::ResponseTimeout { slot: 0xE, polls: 500 });
            }
            Ok(self.response.clone())
        }

        fn load_self_block(&self, _segment_id: u32, _block_index: u32, _ciphertext: &[u8]) -> Result<Vec<u8>, KernelError> {
            unreachable!("sd never issues block requests")
        }
    }

    #[test]
    fn decodes_digest_and_extent_interleaved_table() {
        let mut plaintext = Vec::new();
        plaintext.extend_from_slice(&[0xAAu8; 32]);
        plaintext.extend_from_slice(&0x4000u64.to_le_bytes());
        plaintext.extend_from_slice(&[0xBBu8; 32]);
        plaintext.extend_from_slice(&0x3000u64.to_le_bytes());

        let service = FixedService {
            response: plaintext,
            fail_until: RefCell::new(0),
        };
        let env = NoSleepEnv;
        let block_info = SegmentHeader::build(0, true, true, false, 0, 0, 0x100, 40);
        let target = SegmentHeader::build(1, true, false, true, 2, 0, 0x7000, 0x7000);

        let mut arena = BumpArena::new(self_core::arena::DEFAULT_ARENA_CAPACITY);
        let descriptor =
            decrypt_block_info(Path::new("a.self"), &service, &env, &mut arena, 0, &block_info, &[0u8; 0x100], &target)
                .expect("decode");

        assert_eq!(descriptor.block_count, 2);
        assert_eq!(descriptor.extents[0], Extent { offset: 0, len: 0x4000 });
        assert_eq!(descriptor.extents[1], Extent { offset: 0x4000, len: 0x3000 });
        assert_eq!(descriptor.digests.len(), 2);
    }

    #[test]
    fn retries_then_succeeds_within_budget() {
        let service = FixedService {
            response: vec![0u8; 8],
            fail_until: RefCell::new(1),
        };
        let env = NoSleepEnv;
        let block_info = SegmentHeader::build(0, true, false, false, 0, 0, 0x40, 8);
        let target = SegmentHeader::build(1, true, false, true, 2, 0, 0x4000, 0x4000);

        let mut arena = BumpArena::new(self_core::arena::DEFAULT_ARENA_CAPACITY);
        let descriptor =
            decrypt_block_info(Path::new("a.self"), &service, &env, &mut arena, 0, &block_info, &[0u8; 0x40], &target)
                .expect("decode after retry");
        assert_eq!(descriptor.block_count, 1);
    }

    #[test]
    fn exhausts_retries_and_reports_segment_decrypt() {
        let service = FixedService {
            response: vec![0u8; 8],
            fail_until: RefCell::new(MAX_ATTEMPTS),
        };
        let env = NoSleepEnv;
        let block_info = SegmentHeader::build(0, true, false, false, 0, 0, 0x40, 8);
        let target = SegmentHeader::build(1, true, false, true, 2, 0, 0x4000, 0x4000);

        let mut arena = BumpArena::new(self_core::arena::DEFAULT_ARENA_CAPACITY);
        let err = decrypt_block_info(Path::new("a.self"), &service, &env, &mut arena, 3, &block_info, &[0u8; 0x40], &target)
            .expect_err("exhausted");
        assert!(matches!(
            err,
            SelfError::SegmentDecrypt { segment_index: 3, attempts: MAX_ATTEMPTS, .. }
        ));
    }

    #[test]
    fn reports_internal_error_when_arena_is_too_small() {
        let mut plaintext = Vec::new();
        plaintext.extend_from_slice(&[0xAAu8; 32]);
        plaintext.extend_from_slice(&0x4000u64.to_le_bytes());

        let service = FixedService {
            response: plaintext,
            fail_until: RefCell::new(0),
        };
        let env = NoSleepEnv;
        let block_info = SegmentHeader::build(0, true, true, false, 0, 0, 0x100, 40);
        let target = SegmentHeader::build(1, true, false, true, 2, 0, 0x7000, 0x7000);

        let mut arena = BumpArena::new(4);
        let err = decrypt_block_info(Path::new("a.self"), &service, &env, &mut arena, 0, &block_info, &[0u8; 0x100], &target)
            .expect_err("arena too small");
        assert!(matches!(err, SelfError::Internal { .. }));
    }
}
