//! Image Assembler: lays out the in-memory output ELF that the Block
//! Decryptor then fills with plaintext segment payloads.

use std::path::Path;

use self_core::SelfError;
use self_proto::elf::{Elf64Header, Elf64ProgramHeader, PT_LOAD, PT_NOTE};

/// Trailer immediately following the program header table, carried
/// verbatim from the input into every output image.
pub const TRAILER_SIZE: usize = 0x40;

/// Builds the output image: ELF header, program header table, and the
/// verbatim trailer, sized per the note-or-load rule. Segment payloads are
/// written into the returned buffer afterwards by the Block Decryptor.
pub fn assemble(
    path: &Path,
    elf_header: &Elf64Header,
    program_headers: &[Elf64ProgramHeader],
    trailer: &[u8],
) -> Result<Vec<u8>, SelfError> {
    if trailer.len() < TRAILER_SIZE {
        return Err(SelfError::Internal {
            path: path.to_path_buf(),
            reason: format!("trailer too short: need {TRAILER_SIZE} bytes, got {}", trailer.len()),
        });
    }

    let output_size = output_image_size(path, program_headers)?;
    let mut image = vec![0u8; output_size];

    let header_bytes = elf_header.to_bytes();
    image[..header_bytes.len()].copy_from_slice(&header_bytes);

    let phoff = elf_header.e_phoff() as usize;
    for (i, phdr) in program_headers.iter().enumerate() {
        let start = phoff + i * Elf64ProgramHeader::SIZE;
        let end = start + Elf64ProgramHeader::SIZE;
        if end > image.len() {
            return Err(SelfError::Internal {
                path: path.to_path_buf(),
                reason: "program header table does not fit within the computed output size".into(),
            });
        }
        image[start..end].copy_from_slice(&phdr.to_bytes());
    }

    let trailer_start = phoff + program_headers.len() * Elf64ProgramHeader::SIZE;
    let trailer_end = trailer_start + TRAILER_SIZE;
    if trailer_end > image.len() {
        return Err(SelfError::Internal {
            path: path.to_path_buf(),
            reason: "trailer does not fit within the computed output size".into(),
        });
    }
    image[trailer_start..trailer_end].copy_from_slice(&trailer[..TRAILER_SIZE]);

    Ok(image)
}

/// Output size equals the final `PT_NOTE`'s `p_offset + p_filesz`, falling
/// back to the final `PT_LOAD`'s if no note segment is present.
fn output_image_size(path: &Path, program_headers: &[Elf64ProgramHeader]) -> Result<usize, SelfError> {
    let from_note = program_headers.iter().rev().find(|phdr| phdr.p_type() == PT_NOTE);
    let from_load = program_headers.iter().rev().find(|phdr| phdr.p_type() == PT_LOAD);
    from_note
        .or(from_load)
        .map(|phdr| (phdr.p_offset() + phdr.p_filesz()) as usize)
        .ok_or_else(|| SelfError::Internal {
            path: path.to_path_buf(),
            reason: "no PT_NOTE or PT_LOAD segment to size the output image from".into(),
        })
}
