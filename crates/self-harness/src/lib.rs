//! Deterministic simulation harness for the SELF decrypt/repackage
//! pipeline.
//!
//! In-memory implementations of the `self-core`/`self-kernel` capability
//! traits (`Environment`, `Kmp`, `DecryptService`) for driving
//! `self-pipeline::PipelineDriver` and the lower kernel-facing primitives
//! (`ServiceLock`, `MailboxTransport`) against simulated state instead of a
//! real console and a real privileged kernel component.

pub mod sim_env;
pub mod sim_kmp;
pub mod sim_service;

pub use sim_env::{SimEnvironment, VirtualInstant};
pub use sim_kmp::SimKmp;
pub use sim_service::{identity_transform, SimDecryptService};
