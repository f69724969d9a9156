//! Pipeline Driver: walks a source tree and runs each candidate file through
//! decrypt -> stage -> patch -> re-wrap.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use self_core::arena::{BumpArena, DEFAULT_ARENA_CAPACITY};
use self_core::config::PipelineConfig;
use self_core::descriptor::BlockSegment;
use self_core::progress::{ProgressEvent, ProgressSink};
use self_core::{Environment, ErrorAction, SelfError};
use self_kernel::DecryptService;

use crate::{bd, fse, ia, scp::SelfContainer, sd, tvp};

const CANDIDATE_EXTENSIONS: &[&str] = &[".elf", ".self", ".prx", ".sprx", ".bin"];
const SEGMENT_DECRYPT_MAX_ATTEMPTS: u32 = 3;

/// Counters a CLI summary line is built from.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    /// Files decrypted and written successfully.
    pub processed: u64,
    /// Files skipped because they were not SELF containers.
    pub skipped: u64,
    /// Files that failed and had their partial output unlinked.
    pub failed: u64,
}

/// Orchestrates SCP/SD/BD/IA/FSE/TVP over a source tree.
pub struct PipelineDriver<'a, E, D, P> {
    service: &'a D,
    env: &'a E,
    progress: &'a P,
    config: &'a PipelineConfig,
    platform_magic: u32,
    /// Per-file descriptor-graph scratch, reset at the start of every file.
    /// One of the three process-wide resources the pipeline owns while it
    /// holds the service lock.
    arena: RefCell<BumpArena>,
}

impl<'a, E, D, P> PipelineDriver<'a, E, D, P>
where
    E: Environment,
    D: DecryptService,
    P: ProgressSink,
{
    /// Builds a driver over an already-acquired decrypt service and
    /// progress sink.
    pub fn new(service: &'a D, env: &'a E, progress: &'a P, config: &'a PipelineConfig, platform_magic: u32) -> Self {
        Self {
            service,
            env,
            progress,
            config,
            platform_magic,
            arena: RefCell::new(BumpArena::new(DEFAULT_ARENA_CAPACITY)),
        }
    }

    /// Walks `source_root`, processing every candidate file found, and
    /// returns the run's terminal counters. A fatal (`Io`) error aborts the
    /// walk immediately and is propagated to the caller, which releases the
    /// service lock before returning.
    pub fn run(&self, source_root: &Path, output_root: &Path) -> Result<RunSummary, SelfError> {
        let mut summary = RunSummary::default();
        self.walk(source_root, source_root, output_root, &mut summary)?;
        Ok(summary)
    }

    fn walk(&self, dir: &Path, source_root: &Path, output_root: &Path, summary: &mut RunSummary) -> Result<(), SelfError> {
        let entries = fs::read_dir(dir).map_err(|source| SelfError::Io { path: dir.to_path_buf(), source })?;
        for entry in entries {
            let entry = entry.map_err(|source| SelfError::Io { path: dir.to_path_buf(), source })?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|source| SelfError::Io { path: path.clone(), source })?;

            if file_type.is_dir() {
                if is_union_folder(&path) {
                    continue;
                }
                self.walk(&path, source_root, output_root, summary)?;
                continue;
            }

            if !is_candidate(&path) {
                continue;
            }

            let relpath = path.strip_prefix(source_root).unwrap_or(&path);
            let out_path = output_root.join(relpath);
            self.process_with_retry(&path, &out_path, source_root, output_root, summary)?;
        }
        Ok(())
    }

    fn process_with_retry(
        &self,
        path: &Path,
        out_path: &Path,
        source_root: &Path,
        output_root: &Path,
        summary: &mut RunSummary,
    ) -> Result<(), SelfError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.process_file(path, out_path, source_root, output_root) {
                Ok(()) => {
                    summary.processed += 1;
                    self.progress.report(ProgressEvent::FileFinished { path: path.to_path_buf() });
                    return Ok(());
                },
                Err(SelfError::NotSelf { .. }) => {
                    summary.skipped += 1;
                    self.progress.report(ProgressEvent::FileSkipped { path: path.to_path_buf() });
                    return Ok(());
                },
                Err(err) if err.classify() == ErrorAction::FatalRun => {
                    self.progress.report(ProgressEvent::FileFailed {
                        path: path.to_path_buf(),
                        reason: err.to_string(),
                    });
                    return Err(err);
                },
                Err(err) if err.classify() == ErrorAction::RetryThenUnlink && attempt < SEGMENT_DECRYPT_MAX_ATTEMPTS => {
                    tracing::warn!(path = %path.display(), attempt, %err, "file decrypt failed, retrying whole file");
                    let _ = fs::remove_file(out_path);
                },
                Err(err) => {
                    let _ = fs::remove_file(out_path);
                    summary.failed += 1;
                    self.progress.report(ProgressEvent::FileFailed {
                        path: path.to_path_buf(),
                        reason: err.to_string(),
                    });
                    return Ok(());
                },
            }
        }
    }

    fn process_file(&self, path: &Path, out_path: &Path, source_root: &Path, output_root: &Path) -> Result<(), SelfError> {
        self.progress.report(ProgressEvent::FileStarted { path: path.to_path_buf() });
        self.arena.borrow_mut().reset();
        let buf = fs::read(path).map_err(|source| SelfError::Io { path: path.to_path_buf(), source })?;

        let container = SelfContainer::parse(path, &buf)?;

        let mut descriptors: HashMap<u16, BlockSegment> = HashMap::new();
        for (index, segment) in container.segments().iter().enumerate() {
            if !segment.has_block_info() {
                continue;
            }
            let target_index = segment.segment_id();
            let target = *container.segments().get(target_index as usize).ok_or_else(|| SelfError::Internal {
                path: path.to_path_buf(),
                reason: format!("block-info segment {index} targets out-of-range segment {target_index}"),
            })?;
            let start = segment.offset() as usize;
            let end = start + segment.compressed_size() as usize;
            let ciphertext = buf.get(start..end).ok_or_else(|| SelfError::Internal {
                path: path.to_path_buf(),
                reason: format!("block-info segment {index} ciphertext out of bounds"),
            })?;
            let descriptor = sd::decrypt_block_info(
                path,
                self.service,
                self.env,
                &mut self.arena.borrow_mut(),
                index as u16,
                segment,
                ciphertext,
                &target,
            )?;
            descriptors.insert(target_index, descriptor);
        }

        let header_size = container.header().header_size() as usize;
        let elf_len = self_proto::elf::Elf64Header::SIZE + container.program_headers().len() * self_proto::elf::Elf64ProgramHeader::SIZE;
        let trailer_start = header_size + elf_len;
        let trailer = buf.get(trailer_start..trailer_start + ia::TRAILER_SIZE).ok_or_else(|| SelfError::Internal {
            path: path.to_path_buf(),
            reason: "trailer region out of bounds".into(),
        })?;

        let mut image = ia::assemble(path, container.elf_header(), container.program_headers(), trailer)?;

        for (index, segment) in container.segments().iter().enumerate() {
            if !segment.has_blocks() || segment.has_block_info() {
                continue;
            }
            let index = index as u16;
            let mut descriptor = match descriptors.remove(&index) {
                Some(descriptor) => descriptor,
                None => BlockSegment::synthesize(&mut self.arena.borrow_mut(), segment.uncompressed_size(), segment.block_size())
                    .ok_or_else(|| SelfError::Internal {
                        path: path.to_path_buf(),
                        reason: format!("bump arena exhausted synthesizing descriptor for segment {index}"),
                    })?,
            };
            let target_phdr = bd::find_target_program_header(container.program_headers(), segment.uncompressed_size())
                .copied()
                .ok_or_else(|| SelfError::Internal {
                    path: path.to_path_buf(),
                    reason: format!("no program header matches segment {index}'s uncompressed size"),
                })?;
            bd::decrypt_blocks(path, self.service, self.env, index, segment, &buf, &mut descriptor, &target_phdr, &mut image)?;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|source| SelfError::Io { path: parent.to_path_buf(), source })?;
        }
        fs::write(out_path, &image).map_err(|source| SelfError::Io { path: out_path.to_path_buf(), source })?;

        let relpath = path.strip_prefix(source_root).unwrap_or(path);
        let staging_path = output_root.join("decrypted").join(relpath);
        if let Some(parent) = staging_path.parent() {
            fs::create_dir_all(parent).map_err(|source| SelfError::Io { path: parent.to_path_buf(), source })?;
        }
        fs::write(&staging_path, &image).map_err(|source| SelfError::Io { path: staging_path, source })?;

        if self.config.enable_backport {
            let (target_v5, target_v4) = self.config.resolve_toolchain_targets();
            let mut patched = fs::read(out_path).map_err(|source| SelfError::Io { path: out_path.to_path_buf(), source })?;
            tvp::patch(out_path, &mut patched, target_v5, target_v4, true)?;
            fs::write(out_path, &patched).map_err(|source| SelfError::Io { path: out_path.to_path_buf(), source })?;
        }

        self.rewrap(out_path)
    }

    /// Re-wraps the plaintext ELF at `path` into a fake-signed SELF
    /// container in place, restoring the original file on failure.
    pub fn rewrap(&self, path: &Path) -> Result<(), SelfError> {
        let tmp_path = path.with_extension("tmp");
        fs::rename(path, &tmp_path).map_err(|source| SelfError::Io { path: path.to_path_buf(), source })?;

        let result = (|| -> Result<(), SelfError> {
            let elf_bytes = fs::read(&tmp_path).map_err(|source| SelfError::Io { path: tmp_path.clone(), source })?;
            let encoded = fse::encode(path, &elf_bytes, self.platform_magic)?;
            fs::write(path, &encoded).map_err(|source| SelfError::Io { path: path.to_path_buf(), source })
        })();

        match result {
            Ok(()) => {
                let _ = fs::remove_file(&tmp_path);
                Ok(())
            },
            Err(err) => {
                let _ = fs::rename(&tmp_path, path);
                Err(err)
            },
        }
    }
}

fn is_candidate(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let lower = name.to_ascii_lowercase();
    CANDIDATE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Matches the fragile "skip union folder" heuristic preserved verbatim
/// from the source: an 8-character prefix followed by the literal suffix
/// `-app0-patch0-union`.
fn is_union_folder(path: &Path) -> bool {
    const SUFFIX: &str = "-app0-patch0-union";
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.len() == 8 + SUFFIX.len() && name.ends_with(SUFFIX) && name[..8].chars().all(|c| c.is_ascii_alphanumeric())
}
