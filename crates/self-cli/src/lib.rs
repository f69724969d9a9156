//! Command-line driver for the SELF decrypt/repackage pipeline.
//!
//! This crate is the one non-portable piece of the workspace: it supplies
//! a concrete `Kmp` (over a local kernel-access helper socket), a
//! hand-maintained firmware offset table, and the startup sequence that
//! wires them, `PipelineConfig`, and `tracing-subscriber` into a
//! `self_pipeline::PipelineDriver` run.

pub mod firmware_table;
pub mod kmp_socket;
pub mod runtime;

pub use kmp_socket::SocketKmp;
pub use runtime::{RunArgs, RuntimeError};
