//! Toolchain-Version Patcher: backports an unsigned ELF's process/module
//! parameter blocks to target SDK versions.
//!
//! Idempotent by construction: patching reads the current value and only
//! writes when it differs, and re-running the scan finds the same (already
//! patched) bytes.

use std::path::Path;

use self_core::SelfError;
use self_proto::elf::{
    Elf64Header, Elf64ProgramHeader, SCE_MODULE_PARAM_MAGIC, SCE_PARAM_PS4_SDK_OFFSET, SCE_PARAM_PS5_SDK_OFFSET,
    SCE_PROCESS_PARAM_MAGIC, PT_SCE_MODULE_PARAM, PT_SCE_PROCPARAM,
};

const PREFIX_TOLERANCE: u64 = 8;

/// Patches every process/module parameter block in `buf` to `target_v5`/
/// `target_v4`, in place. Skips silently (returns `Ok` unchanged) on a
/// signed container (bad ELF magic) or when `enabled` is false.
pub fn patch(path: &Path, buf: &mut [u8], target_v5: u32, target_v4: u32, enabled: bool) -> Result<(), SelfError> {
    if !enabled {
        return Ok(());
    }
    let elf_header = match Elf64Header::parse(buf) {
        Ok(header) => header,
        Err(self_proto::ProtoError::NotElf) => return Ok(()),
        Err(err) => return Err(internal(path, err)),
    };

    let phoff = elf_header.e_phoff() as usize;
    let phnum = elf_header.e_phnum() as usize;

    for i in 0..phnum {
        let start = phoff + i * Elf64ProgramHeader::SIZE;
        let end = start + Elf64ProgramHeader::SIZE;
        let phdr_buf = buf.get(start..end).ok_or_else(|| SelfError::Internal {
            path: path.to_path_buf(),
            reason: "program header table out of bounds".into(),
        })?;
        let phdr = Elf64ProgramHeader::parse(phdr_buf).map_err(|err| internal(path, err))?;

        let expected_magic = match phdr.p_type() {
            PT_SCE_PROCPARAM => SCE_PROCESS_PARAM_MAGIC,
            PT_SCE_MODULE_PARAM => SCE_MODULE_PARAM_MAGIC,
            _ => continue,
        };

        let Some(base) = locate_parameter_block(buf, phdr.p_offset(), expected_magic) else {
            continue;
        };

        patch_u32_field(path, buf, base + SCE_PARAM_PS5_SDK_OFFSET, target_v5)?;
        patch_u32_field(path, buf, base + SCE_PARAM_PS4_SDK_OFFSET, target_v4)?;
    }

    Ok(())
}

/// Finds the base offset of the parameter block at `p_offset`, tolerating
/// an optional 8-byte prefix header before the magic. Returns `None` if
/// neither position matches — including when a candidate offset falls
/// outside `buf` entirely, which just means that candidate can't be the
/// parameter block and the next one (or nothing) should be tried.
fn locate_parameter_block(buf: &[u8], p_offset: u64, expected_magic: u32) -> Option<u64> {
    for candidate in [p_offset, p_offset + PREFIX_TOLERANCE] {
        let start = candidate as usize;
        let Some(magic_bytes) = buf.get(start..start + 4) else {
            continue;
        };
        let magic = u32::from_le_bytes(magic_bytes.try_into().expect("4-byte slice"));
        if magic == expected_magic {
            return Some(candidate);
        }
    }
    None
}

fn patch_u32_field(path: &Path, buf: &mut [u8], offset: u64, value: u32) -> Result<(), SelfError> {
    let start = offset as usize;
    let end = start + 4;
    let field = buf.get_mut(start..end).ok_or_else(|| SelfError::Internal {
        path: path.to_path_buf(),
        reason: format!("parameter field at {offset:#x} is out of bounds"),
    })?;
    let value_bytes = value.to_le_bytes();
    if field != value_bytes {
        field.copy_from_slice(&value_bytes);
    }
    Ok(())
}

fn internal(path: &Path, err: self_proto::ProtoError) -> SelfError {
    SelfError::Internal {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}
