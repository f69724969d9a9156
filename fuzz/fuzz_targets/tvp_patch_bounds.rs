//! Fuzz target for the Toolchain-Version Patcher.
//!
//! `tvp::patch` walks an unsigned ELF's program header table and rewrites
//! fixed-offset fields inside `PT_SCE_PROCPARAM`/`PT_SCE_MODULE_PARAM`
//! segments in place. The interesting failure mode isn't a bad return value,
//! it's an out-of-bounds write driven by an attacker-controlled `p_offset`/
//! `p_filesz` pair — this target exercises that arithmetic directly against
//! arbitrary program header bytes.

#![no_main]

use std::path::Path;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use self_pipeline::tvp;

#[derive(Arbitrary, Debug)]
struct Input {
    buf: Vec<u8>,
    target_v5: u32,
    target_v4: u32,
    enabled: bool,
}

fuzz_target!(|input: Input| {
    let mut buf = input.buf;
    let _ = tvp::patch(Path::new("fuzz.elf"), &mut buf, input.target_v5, input.target_v4, input.enabled);
});
