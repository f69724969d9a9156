//! Fake-Sign Encoder: rewrites a plain ELF into a SELF-shaped container that
//! the target loader accepts as if genuinely signed.
//!
//! Every field below is an exact constant from the container format, not a
//! design choice — a loader rejects any divergence.

use std::path::Path;

use self_core::SelfError;
use self_proto::elf::{is_fse_eligible, Elf64Header, Elf64ProgramHeader, PT_SCE_VERSION};
use self_proto::self_format::{align_up, ExInfo, MetaBlock, MetaFooter, NpdrmBlock, SegmentHeader, SelfHeader};
use sha2::{Digest, Sha256};

const ALIGN: u64 = 16;
const BLOCK_SIZE: u64 = 0x4000;
const DIGEST_BLOCK_BITS: u8 = 2;

/// Zero signature region following the meta-footer, distinct from the
/// footer's own embedded `signature` field. `out` is zero-initialized, so
/// this region never needs an explicit write — only the size accounting
/// below needs to reserve it before segment payloads begin.
const ZERO_SIGNATURE_SIZE: u64 = 0x100;

struct Eligible {
    phdr_index: usize,
    p_offset: u64,
    p_filesz: u64,
}

/// Encodes `elf_bytes` (a complete plain ELF file) into a fake-signed SELF
/// container for `platform_magic`.
pub fn encode(path: &Path, elf_bytes: &[u8], platform_magic: u32) -> Result<Vec<u8>, SelfError> {
    let elf_header = Elf64Header::parse(elf_bytes).map_err(|err| internal(path, err))?;
    let phoff = elf_header.e_phoff() as usize;
    let phnum = elf_header.e_phnum() as usize;

    let mut eligible = Vec::new();
    let mut version_segment: Option<&[u8]> = None;
    for i in 0..phnum {
        let start = phoff + i * Elf64ProgramHeader::SIZE;
        let end = start + Elf64ProgramHeader::SIZE;
        let buf = elf_bytes.get(start..end).ok_or_else(|| SelfError::Internal {
            path: path.to_path_buf(),
            reason: "program header table truncated".into(),
        })?;
        let phdr = Elf64ProgramHeader::parse(buf).map_err(|err| internal(path, err))?;
        if is_fse_eligible(phdr.p_type()) {
            eligible.push(Eligible {
                phdr_index: i,
                p_offset: phdr.p_offset(),
                p_filesz: phdr.p_filesz(),
            });
        } else if phdr.p_type() == PT_SCE_VERSION {
            let seg_start = phdr.p_offset() as usize;
            let seg_end = seg_start + phdr.p_filesz() as usize;
            version_segment = elf_bytes.get(seg_start..seg_end);
        }
    }

    let num_entries = (2 * eligible.len()) as u16;
    let header_size = (SelfHeader::SIZE + num_entries as usize * SegmentHeader::SIZE) as u64;

    let elf_region_offset = align_up(header_size, ALIGN);
    let elf_region_len = (Elf64Header::SIZE + phnum * Elf64ProgramHeader::SIZE) as u64;

    let meta_offset = align_up(elf_region_offset + elf_region_len, ALIGN);
    let meta_size = ExInfo::SIZE as u64
        + NpdrmBlock::SIZE as u64
        + num_entries as u64 * MetaBlock::SIZE as u64
        + MetaFooter::SIZE as u64
        + ZERO_SIGNATURE_SIZE;

    let exinfo_offset = meta_offset;
    let npdrm_offset = exinfo_offset + ExInfo::SIZE as u64;
    let metablocks_offset = npdrm_offset + NpdrmBlock::SIZE as u64;
    let footer_offset = metablocks_offset + num_entries as u64 * MetaBlock::SIZE as u64;

    let mut segments = Vec::with_capacity(eligible.len() * 2);
    let mut payload_writes: Vec<(u64, Option<(u64, u64)>)> = Vec::with_capacity(eligible.len() * 2);
    let mut cursor = align_up(meta_offset + meta_size, ALIGN);

    for (source_index, seg) in eligible.iter().enumerate() {
        let enc_size = seg.p_filesz.div_ceil(BLOCK_SIZE) * 32;
        segments.push(SegmentHeader::build(
            (2 * source_index + 1) as u16,
            true,
            true,
            false,
            0,
            cursor,
            enc_size,
            enc_size,
        ));
        payload_writes.push((cursor, None));
        cursor = align_up(cursor + enc_size, ALIGN);

        segments.push(SegmentHeader::build(
            seg.phdr_index as u16,
            true,
            false,
            true,
            DIGEST_BLOCK_BITS,
            cursor,
            seg.p_filesz,
            seg.p_filesz,
        ));
        payload_writes.push((cursor, Some((seg.p_offset, seg.p_filesz))));
        cursor = align_up(cursor + seg.p_filesz, ALIGN);
    }

    let version_write = version_segment.map(|bytes| {
        let offset = cursor;
        cursor += bytes.len() as u64;
        (offset, bytes)
    });

    let file_size = cursor;
    let mut header = SelfHeader::new(platform_magic, header_size as u16, meta_size as u16, num_entries);
    header.set_file_size(file_size);

    let mut out = vec![0u8; file_size as usize];
    let mut pos = 0usize;
    write_at(&mut out, &mut pos, &header.to_bytes());
    for segment in &segments {
        write_at(&mut out, &mut pos, &segment.to_bytes());
    }

    out[elf_region_offset as usize..elf_region_offset as usize + elf_region_len as usize]
        .copy_from_slice(&elf_bytes[..elf_region_len as usize]);

    let digest: [u8; 32] = Sha256::digest(elf_bytes).into();
    let exinfo = ExInfo::new(digest);
    out[exinfo_offset as usize..exinfo_offset as usize + ExInfo::SIZE].copy_from_slice(&exinfo.to_bytes());

    let npdrm = NpdrmBlock::fake();
    out[npdrm_offset as usize..npdrm_offset as usize + NpdrmBlock::SIZE].copy_from_slice(&npdrm.to_bytes());

    for i in 0..num_entries as usize {
        let start = metablocks_offset as usize + i * MetaBlock::SIZE;
        out[start..start + MetaBlock::SIZE].copy_from_slice(&MetaBlock::default().to_bytes());
    }

    let footer = MetaFooter::fake();
    out[footer_offset as usize..footer_offset as usize + MetaFooter::SIZE].copy_from_slice(&footer.to_bytes());

    for (offset, source) in &payload_writes {
        if let Some((src_offset, len)) = source {
            let dst = *offset as usize;
            let src = *src_offset as usize;
            let len = *len as usize;
            out[dst..dst + len].copy_from_slice(&elf_bytes[src..src + len]);
        }
        // Digest-table payloads are written zero: the digests themselves are
        // produced by the real signing path this encoder stands in for.
    }

    if let Some((offset, bytes)) = version_write {
        let start = offset as usize;
        out[start..start + bytes.len()].copy_from_slice(bytes);
    }

    Ok(out)
}

fn write_at(out: &mut [u8], cursor: &mut usize, bytes: &[u8]) {
    out[*cursor..*cursor + bytes.len()].copy_from_slice(bytes);
    *cursor += bytes.len();
}

fn internal(path: &Path, err: self_proto::ProtoError) -> SelfError {
    SelfError::Internal {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use self_proto::elf::PT_LOAD;
    use self_proto::self_format::SELF_MAGIC_PS5;

    use super::*;

    fn sample_elf_with_one_load() -> Vec<u8> {
        sample_elf_with_one_load_of_size(0x20)
    }

    fn sample_elf_with_one_load_of_size(payload_len: usize) -> Vec<u8> {
        let phoff = Elf64Header::SIZE as u64;
        let phnum = 1u16;
        let payload = vec![0x7Au8; payload_len];
        let phdr_area_end = phoff as usize + Elf64ProgramHeader::SIZE;
        let payload_offset = align_up(phdr_area_end as u64, ALIGN) as usize;

        let mut buf = vec![0u8; payload_offset + payload.len()];
        buf[..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        buf[0x20..0x28].copy_from_slice(&phoff.to_le_bytes());
        buf[0x38..0x3A].copy_from_slice(&phnum.to_le_bytes());

        buf[phoff as usize..phoff as usize + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        buf[phoff as usize + 8..phoff as usize + 16].copy_from_slice(&(payload_offset as u64).to_le_bytes());
        buf[phoff as usize + 32..phoff as usize + 40].copy_from_slice(&(payload.len() as u64).to_le_bytes());

        buf[payload_offset..payload_offset + payload.len()].copy_from_slice(&payload);
        buf
    }

    #[test]
    fn encodes_two_entries_for_one_load_segment() {
        let elf = sample_elf_with_one_load();
        let encoded = encode(Path::new("a.elf"), &elf, SELF_MAGIC_PS5).expect("encode");
        let header = SelfHeader::parse(&encoded).expect("parse header");
        assert_eq!(header.segment_count(), 2);
        assert_eq!(header.magic(), SELF_MAGIC_PS5);
    }

    #[test]
    fn exinfo_digest_matches_sha256_of_source() {
        let elf = sample_elf_with_one_load();
        let expected: [u8; 32] = Sha256::digest(&elf).into();
        let encoded = encode(Path::new("a.elf"), &elf, SELF_MAGIC_PS5).expect("encode");
        let header = SelfHeader::parse(&encoded).expect("parse header");
        let elf_region_offset = align_up(header.header_size() as u64, ALIGN);
        let elf_region_len = Elf64Header::SIZE as u64 + Elf64ProgramHeader::SIZE as u64;
        let meta_offset = align_up(elf_region_offset + elf_region_len, ALIGN) as usize;
        let exinfo_bytes = &encoded[meta_offset..meta_offset + ExInfo::SIZE];
        assert_eq!(&exinfo_bytes[32..64], &expected[..]);
    }

    #[test]
    fn no_eligible_segments_still_writes_meta_region() {
        let mut buf = vec![0u8; Elf64Header::SIZE];
        buf[..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        buf[0x20..0x28].copy_from_slice(&(Elf64Header::SIZE as u64).to_le_bytes());
        let encoded = encode(Path::new("a.elf"), &buf, SELF_MAGIC_PS5).expect("encode");
        let header = SelfHeader::parse(&encoded).expect("parse header");
        assert_eq!(header.segment_count(), 0);
        assert!(encoded.len() > header.header_size() as usize);
    }

    #[test]
    fn meta_size_reserves_the_zero_signature_region_after_the_footer() {
        let elf = sample_elf_with_one_load();
        let encoded = encode(Path::new("a.elf"), &elf, SELF_MAGIC_PS5).expect("encode");
        let header = SelfHeader::parse(&encoded).expect("parse header");

        let elf_region_offset = align_up(header.header_size() as u64, ALIGN);
        let elf_region_len = Elf64Header::SIZE as u64 + Elf64ProgramHeader::SIZE as u64;
        let meta_offset = align_up(elf_region_offset + elf_region_len, ALIGN);
        let footer_offset = meta_offset + ExInfo::SIZE as u64 + NpdrmBlock::SIZE as u64 + 2 * MetaBlock::SIZE as u64;
        let footer_end = footer_offset + MetaFooter::SIZE as u64;

        let meta_end = meta_offset + header.meta_size() as u64;
        assert_eq!(meta_end, footer_end + ZERO_SIGNATURE_SIZE);
    }

    proptest! {
        #[test]
        fn file_size_matches_the_actual_encoded_length(payload_len in 0usize..0x8000) {
            let elf = sample_elf_with_one_load_of_size(payload_len);
            let encoded = encode(Path::new("a.elf"), &elf, SELF_MAGIC_PS5).expect("encode");
            let header = SelfHeader::parse(&encoded).expect("parse header");
            prop_assert_eq!(header.file_size(), encoded.len() as u64);
        }

        #[test]
        fn first_payload_starts_at_or_after_the_zero_signature_region(payload_len in 0usize..0x8000) {
            let elf = sample_elf_with_one_load_of_size(payload_len);
            let encoded = encode(Path::new("a.elf"), &elf, SELF_MAGIC_PS5).expect("encode");
            let header = SelfHeader::parse(&encoded).expect("parse header");

            let elf_region_offset = align_up(header.header_size() as u64, ALIGN);
            let elf_region_len = Elf64Header::SIZE as u64 + Elf64ProgramHeader::SIZE as u64;
            let meta_offset = align_up(elf_region_offset + elf_region_len, ALIGN);
            let signature_region_end = meta_offset + header.meta_size() as u64;

            // the digest-table segment's offset is the segment table's first entry
            let first_segment = SegmentHeader::parse(&encoded[SelfHeader::SIZE..]).expect("parse first segment entry");
            prop_assert!(first_segment.offset() >= signature_region_end);
        }
    }
}
