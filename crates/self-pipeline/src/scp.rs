//! SELF Container Parser: validates the magic and exposes the header,
//! segment table, and embedded ELF structures of a mapped SELF file.

use std::path::Path;

use self_core::SelfError;
use self_proto::elf::{parse_program_headers, Elf64Header, Elf64ProgramHeader};
use self_proto::self_format::{SegmentHeader, SelfHeader};

/// A parsed view over one SELF file's bytes. Borrows nothing from the
/// backing buffer except via the returned structures, which are plain
/// owned copies (the container structures are small and `Copy`).
pub struct SelfContainer {
    header: SelfHeader,
    segments: Vec<SegmentHeader>,
    elf_header: Elf64Header,
    program_headers: Vec<Elf64ProgramHeader>,
}

impl SelfContainer {
    /// Parses `buf` as a SELF container for `path` (used only to attribute
    /// errors). Returns [`SelfError::NotSelf`] on magic mismatch, which the
    /// pipeline driver treats as "skip silently."
    pub fn parse(path: &Path, buf: &[u8]) -> Result<Self, SelfError> {
        let header = match SelfHeader::parse(buf) {
            Ok(header) => header,
            Err(self_proto::ProtoError::BadMagic) | Err(self_proto::ProtoError::Truncated { .. }) => {
                return Err(SelfError::NotSelf { path: path.to_path_buf() });
            },
            Err(err) => return Err(internal(path, err)),
        };

        let mut segments = Vec::with_capacity(header.segment_count() as usize);
        let mut cursor = SelfHeader::SIZE;
        for _ in 0..header.segment_count() {
            let entry = buf
                .get(cursor..)
                .ok_or_else(|| internal(path, self_proto::ProtoError::Truncated { needed: SegmentHeader::SIZE, got: 0 }))?;
            segments.push(SegmentHeader::parse(entry).map_err(|err| internal(path, err))?);
            cursor += SegmentHeader::SIZE;
        }

        let elf_buf = buf.get(cursor..).ok_or_else(|| {
            internal(path, self_proto::ProtoError::Truncated { needed: Elf64Header::SIZE, got: 0 })
        })?;
        let elf_header = Elf64Header::parse(elf_buf).map_err(|err| internal(path, err))?;
        let program_headers = parse_program_headers(elf_buf, &elf_header).map_err(|err| internal(path, err))?;

        Ok(Self {
            header,
            segments,
            elf_header,
            program_headers,
        })
    }

    /// The container header.
    #[must_use]
    pub fn header(&self) -> &SelfHeader {
        &self.header
    }

    /// The dense segment table.
    #[must_use]
    pub fn segments(&self) -> &[SegmentHeader] {
        &self.segments
    }

    /// The embedded plain ELF header.
    #[must_use]
    pub fn elf_header(&self) -> &Elf64Header {
        &self.elf_header
    }

    /// The embedded program header table.
    #[must_use]
    pub fn program_headers(&self) -> &[Elf64ProgramHeader] {
        &self.program_headers
    }
}

fn internal(path: &Path, err: self_proto::ProtoError) -> SelfError {
    SelfError::Internal {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}
