//! Block Decryptor: turns each extent of a data segment's [`BlockSegment`]
//! descriptor into plaintext and places it into the output image.

use std::path::Path;
use std::time::Duration;

use self_core::descriptor::BlockSegment;
use self_core::{Environment, SelfError};
use self_kernel::DecryptService;
use self_proto::elf::Elf64ProgramHeader;
use self_proto::self_format::SegmentHeader;

const MAX_ATTEMPTS: u32 = 5;
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Decrypts every block of `descriptor`'s target segment and writes the
/// plaintext into `descriptor.data`, then copies the assembled payload into
/// `image` at `target_phdr.p_offset()`.
#[allow(clippy::too_many_arguments)]
pub fn decrypt_blocks<D: DecryptService, E: Environment>(
    path: &Path,
    service: &D,
    env: &E,
    segment_index: u16,
    segment: &SegmentHeader,
    ciphertext: &[u8],
    descriptor: &mut BlockSegment,
    target_phdr: &Elf64ProgramHeader,
    image: &mut [u8],
) -> Result<(), SelfError> {
    let segment_offset = segment.offset();

    for i in 0..descriptor.block_count {
        let extent = descriptor.extents[i];
        let stage_start = (segment_offset + extent.offset) as usize;
        let stage_len = segment.block_size() as usize;
        let block_ciphertext = ciphertext
            .get(stage_start..stage_start + stage_len)
            .or_else(|| ciphertext.get(stage_start..))
            .ok_or_else(|| SelfError::Internal {
                path: path.to_path_buf(),
                reason: format!("block {i} of segment {segment_index} has no ciphertext to stage"),
            })?;

        let plaintext = load_with_retry(path, service, env, segment_index, i as u32, block_ciphertext)?;
        let len = extent.len as usize;
        descriptor.place_block(extent, &plaintext[..len.min(plaintext.len())]);

        let image_start = (target_phdr.p_offset() + extent.offset) as usize;
        let image_end = image_start + len;
        if image_end > image.len() {
            return Err(SelfError::Internal {
                path: path.to_path_buf(),
                reason: format!("block {i} of segment {segment_index} would write past the output image"),
            });
        }
        image[image_start..image_end].copy_from_slice(&descriptor.data[extent.offset as usize..extent.offset as usize + len]);
    }

    Ok(())
}

fn load_with_retry<D: DecryptService, E: Environment>(
    path: &Path,
    service: &D,
    env: &E,
    segment_index: u16,
    block_index: u32,
    ciphertext: &[u8],
) -> Result<Vec<u8>, SelfError> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match service.load_self_block(u32::from(segment_index), block_index, ciphertext) {
            Ok(plaintext) => return Ok(plaintext),
            Err(err) if attempts < MAX_ATTEMPTS => {
                tracing::warn!(
                    path = %path.display(),
                    segment_index,
                    block_index,
                    attempt = attempts,
                    %err,
                    "block decrypt failed, retrying"
                );
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

/// Locates the program header whose `p_filesz` matches `uncompressed_size`
/// exactly, per the first-match tie-break rule.
#[must_use]
pub fn find_target_program_header(headers: &[Elf64ProgramHeader], uncompressed_size: u64) -> Option<&Elf64ProgramHeader> {
    headers.iter().find(|phdr| phdr.p_filesz() == uncompressed_size)
}
