//! Domain types, error model, and capability traits shared across the SELF
//! decryption and repackaging pipeline.
//!
//! This crate has no I/O of its own: it defines the arena, the descriptor
//! graph, the firmware offset table's data shape, the error model, the
//! capability traits (`Environment`, `ProgressSink`) that let `self-kernel`
//! and `self-pipeline` be exercised against simulated backends, and the
//! configuration surface.

pub mod arena;
pub mod config;
pub mod descriptor;
pub mod env;
mod error;
pub mod firmware;
pub mod progress;

pub use env::{Environment, SystemEnvironment};
pub use error::{ErrorAction, SelfError};
