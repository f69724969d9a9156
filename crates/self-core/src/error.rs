//! The pipeline-wide error model.
//!
//! Five variants, matching the sum type the pipeline driver pattern-matches
//! on to decide what to do with a failed file. Callers should match on
//! [`SelfError::classify`] rather than re-deriving this table at each call
//! site.

use std::path::PathBuf;

use self_proto::ProtoError;
use thiserror::Error;

/// What the pipeline driver should do after a file-level operation returns
/// this error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Not a SELF file: skip silently, return success for this file.
    Skip,
    /// Fatal to the whole run, after releasing the service lock.
    FatalRun,
    /// Unlink any partial output and continue with the next file.
    UnlinkAndContinue,
    /// Retry the whole file (bounded); unlink and continue once retries are
    /// exhausted.
    RetryThenUnlink,
}

/// Errors that can occur while decrypting, patching, or re-wrapping a single
/// file, or while walking the source tree.
#[derive(Debug, Error)]
pub enum SelfError {
    /// The input does not carry a recognized SELF magic. Not a failure: the
    /// pipeline treats mixed trees (containing non-SELF files) as normal.
    #[error("{path}: not a SELF container")]
    NotSelf {
        /// Path of the file that failed the magic check.
        path: PathBuf,
    },

    /// Filesystem I/O failure. Fatal to the run.
    #[error("{path}: I/O error: {source}")]
    Io {
        /// Path the I/O operation was against.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Arena exhaustion, bounds violation, unexpected magic inside a nested
    /// structure, or another internal invariant violation.
    #[error("{path}: internal error: {reason}")]
    Internal {
        /// Path being processed when the violation was detected.
        path: PathBuf,
        /// Human-readable description of the violated invariant.
        reason: String,
    },

    /// The running firmware version has no entry in the firmware offset
    /// table. Fatal; never raised mid-decrypt.
    #[error("unsupported firmware version 0x{version:08x}")]
    UnsupportedFirmware {
        /// The firmware version that failed to resolve.
        version: u32,
    },

    /// The decrypt service failed to service a segment or block request
    /// after exhausting its retry budget.
    #[error("{path}: segment decrypt failed for segment {segment_index} after {attempts} attempts")]
    SegmentDecrypt {
        /// Path being decrypted.
        path: PathBuf,
        /// Index of the segment that failed.
        segment_index: u16,
        /// Number of attempts made before giving up.
        attempts: u32,
    },
}

impl SelfError {
    /// Classifies this error per the table in the error-handling design: the
    /// pipeline driver should never match on variants directly, only on
    /// this.
    #[must_use]
    pub fn classify(&self) -> ErrorAction {
        match self {
            Self::NotSelf { .. } => ErrorAction::Skip,
            Self::Io { .. } | Self::UnsupportedFirmware { .. } => ErrorAction::FatalRun,
            Self::Internal { .. } => ErrorAction::UnlinkAndContinue,
            Self::SegmentDecrypt { .. } => ErrorAction::RetryThenUnlink,
        }
    }

    /// Path associated with this error, if any (firmware/version errors have
    /// no associated file).
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::NotSelf { path } | Self::Io { path, .. } | Self::Internal { path, .. } | Self::SegmentDecrypt { path, .. } => {
                Some(path)
            },
            Self::UnsupportedFirmware { .. } => None,
        }
    }
}

impl From<ProtoError> for SelfError {
    fn from(err: ProtoError) -> Self {
        Self::Internal {
            path: PathBuf::new(),
            reason: err.to_string(),
        }
    }
}
