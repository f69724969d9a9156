//! Error type for container parsing and encoding.

use thiserror::Error;

/// Failures that can occur while parsing or writing SELF/ELF binary structures.
///
/// This is intentionally narrower than the pipeline-wide error enum: it has no
/// notion of retry or "skip the file", only "these bytes do not describe a
/// valid structure". Callers fold it into their own error type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    /// Buffer too short for the structure being parsed.
    #[error("buffer too short: need at least {needed} bytes, got {got}")]
    Truncated {
        /// Minimum buffer length required.
        needed: usize,
        /// Actual buffer length observed.
        got: usize,
    },

    /// SELF container magic did not match the expected platform magic.
    #[error("not a SELF container (magic mismatch)")]
    BadMagic,

    /// ELF magic (`\x7FELF`) did not match.
    #[error("not an ELF file (magic mismatch)")]
    NotElf,

    /// A declared size or offset would read or write past the end of the
    /// backing buffer.
    #[error("field out of bounds: offset {offset} + len {len} exceeds buffer size {size}")]
    OutOfBounds {
        /// Offset the read/write started at.
        offset: usize,
        /// Length of the attempted read/write.
        len: usize,
        /// Size of the backing buffer.
        size: usize,
    },

    /// Segment count, entry count, or similar declared size is internally
    /// inconsistent with the rest of the header.
    #[error("inconsistent container layout: {0}")]
    BadLayout(&'static str),
}
