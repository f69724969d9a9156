//! End-to-end simulation: a hand-built minimal SELF container run through
//! the real `self-pipeline::PipelineDriver`, decrypted by an in-memory
//! [`SimDecryptService`] instead of a real mailbox, on a virtual clock.

use std::fs;

use self_core::config::PipelineConfig;
use self_core::progress::{ProgressEvent, RecordingProgressSink};
use self_harness::{identity_transform, SimDecryptService, SimEnvironment};
use self_pipeline::{PipelineDriver, SelfContainer};
use self_proto::elf::{Elf64Header, Elf64ProgramHeader, PT_LOAD};
use self_proto::self_format::{SegmentHeader, SelfHeader, SELF_MAGIC_PS5};

const BLOCK_SIZE: usize = 0x4000;

/// Builds one minimal, single-segment SELF container: a single data segment
/// with no block-info table (so its [`self_core::descriptor::BlockSegment`]
/// is synthesized from `uncompressed_size`/`block_size`, exercising the
/// Block Decryptor without the Segment Decryptor), exactly one 16 KiB
/// ciphertext block, filled with a recognizable byte pattern.
fn build_container() -> Vec<u8> {
    let header = SelfHeader::new(SELF_MAGIC_PS5, 64, 0, 1);
    let segment = SegmentHeader::build(0, true, false, true, 2, 256, BLOCK_SIZE as u64, BLOCK_SIZE as u64);

    let mut elf_header_bytes = [0u8; Elf64Header::SIZE];
    elf_header_bytes[..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    elf_header_bytes[0x20..0x28].copy_from_slice(&(Elf64Header::SIZE as u64).to_le_bytes());
    elf_header_bytes[0x38..0x3A].copy_from_slice(&1u16.to_le_bytes());

    let mut phdr_bytes = [0u8; Elf64ProgramHeader::SIZE];
    phdr_bytes[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
    phdr_bytes[8..16].copy_from_slice(&0x1000u64.to_le_bytes());
    phdr_bytes[32..40].copy_from_slice(&(BLOCK_SIZE as u64).to_le_bytes());

    let trailer = [0x5Au8; 0x40];
    let ciphertext = vec![0xABu8; BLOCK_SIZE];

    let mut buf = Vec::new();
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(&segment.to_bytes());
    buf.extend_from_slice(&elf_header_bytes);
    buf.extend_from_slice(&phdr_bytes);
    buf.extend_from_slice(&trailer);
    buf.resize(256, 0);
    buf.extend_from_slice(&ciphertext);
    buf
}

#[test]
fn decrypts_and_rewraps_a_single_block_container() {
    let source_dir = tempfile::tempdir().expect("source dir");
    let output_dir = tempfile::tempdir().expect("output dir");
    fs::write(source_dir.path().join("game.self"), build_container()).expect("write fixture");

    let service = SimDecryptService::new(identity_transform);
    let env = SimEnvironment::new();
    let progress = RecordingProgressSink::new();
    let config = PipelineConfig {
        enable_backport: false,
        ..PipelineConfig::default()
    };
    let driver = PipelineDriver::new(&service, &env, &progress, &config, SELF_MAGIC_PS5);

    let summary = driver.run(source_dir.path(), output_dir.path()).expect("run");
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.failed, 0);

    let events = progress.events();
    assert!(matches!(events[0], ProgressEvent::FileStarted { .. }));
    assert!(matches!(events.last().expect("at least one event"), ProgressEvent::FileFinished { .. }));

    let out_bytes = fs::read(output_dir.path().join("game.self")).expect("read output");
    let container = SelfContainer::parse(std::path::Path::new("game.self"), &out_bytes).expect("re-parse output");
    assert_eq!(container.header().magic(), SELF_MAGIC_PS5);
    assert_eq!(container.header().segment_count(), 2, "one PT_LOAD re-encodes to two segment entries");
}

#[test]
fn a_non_self_file_is_skipped_not_failed() {
    let source_dir = tempfile::tempdir().expect("source dir");
    let output_dir = tempfile::tempdir().expect("output dir");
    fs::write(source_dir.path().join("readme.bin"), vec![0u8; 16]).expect("write fixture");

    let service = SimDecryptService::new(identity_transform);
    let env = SimEnvironment::new();
    let progress = RecordingProgressSink::new();
    let config = PipelineConfig::default();
    let driver = PipelineDriver::new(&service, &env, &progress, &config, SELF_MAGIC_PS5);

    let summary = driver.run(source_dir.path(), output_dir.path()).expect("run");
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.processed, 0);
    assert!(!output_dir.path().join("readme.bin").exists());
}
