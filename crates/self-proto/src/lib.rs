//! Binary structures for the SELF container format and its embedded ELF
//! image: header, segment table, ELF header/program headers, and the
//! fixed-layout blocks the fake-sign encoder writes.
//!
//! This crate is pure data definitions and parsing/serialization — no I/O,
//! no cryptography, no kernel interaction. Higher-level orchestration lives
//! in `self-pipeline`.

pub mod elf;
mod error;
pub mod self_format;

pub use error::ProtoError;
