//! SELF decrypt/stage/patch/re-wrap orchestration.
//!
//! Each module below is one component from the design: the SELF Container
//! Parser (`scp`), the Segment Decryptor (`sd`), the Block Decryptor (`bd`),
//! the Image Assembler (`ia`), the Fake-Sign Encoder (`fse`), the
//! Toolchain-Version Patcher (`tvp`), and the Pipeline Driver (`driver`) that
//! sequences all of them over a source tree.

pub mod bd;
pub mod driver;
pub mod fse;
pub mod ia;
pub mod scp;
pub mod sd;
pub mod tvp;

pub use driver::{PipelineDriver, RunSummary};
pub use scp::SelfContainer;
