//! Fuzz target for `SelfContainer::parse`.
//!
//! Feeds arbitrary bytes through the SELF header/segment-table/embedded-ELF
//! parser. Every malformed input must return an `Err`, never panic: bad
//! magic, truncated segment tables, and out-of-bounds program header
//! offsets are all expected inputs from a file on disk, not programmer
//! error.

#![no_main]

use std::path::Path;

use libfuzzer_sys::fuzz_target;
use self_pipeline::SelfContainer;

fuzz_target!(|data: &[u8]| {
    let _ = SelfContainer::parse(Path::new("fuzz.self"), data);
});
