//! The process-wide service lock: a writer ticket over the platform's single
//! mailbox slot, taken at pipeline start and released at pipeline end.
//!
//! Acquisition writes a well-known word 256 times at 1 ms spacing — a
//! defense-in-depth measure against concurrent kernel-side users, not
//! something to optimize away. Release restores the word observed before
//! acquisition.

use std::time::Duration;

use self_core::Environment;
use tracing::{error, trace};

use crate::error::KernelError;
use crate::kmp::Kmp;

const ACQUIRE_WRITES: u32 = 256;
const ACQUIRE_INTERVAL: Duration = Duration::from_millis(1);
const LOCK_WORD: u64 = 1;

/// RAII guard over the platform service lock. Acquired by
/// [`ServiceLock::acquire`]; released on drop, including on unwind.
pub struct ServiceLock<'a, K> {
    kmp: &'a K,
    lock_va: u64,
    saved_word: u64,
}

impl<'a, K: Kmp> ServiceLock<'a, K> {
    /// Takes the writer ticket: saves the word currently at `lock_va`, then
    /// writes [`LOCK_WORD`] there 256 times at 1 ms spacing.
    pub fn acquire<E: Environment>(kmp: &'a K, env: &E, lock_va: u64) -> Result<Self, KernelError> {
        let saved_word = kmp.read_u64(lock_va)?;
        for _ in 0..ACQUIRE_WRITES {
            kmp.kwrite(lock_va, &LOCK_WORD.to_le_bytes())?;
            env.sleep(ACQUIRE_INTERVAL);
        }
        trace!(lock_va, "service lock acquired");
        Ok(Self { kmp, lock_va, saved_word })
    }

    fn release(&self) -> Result<(), KernelError> {
        self.kmp.kwrite(self.lock_va, &self.saved_word.to_le_bytes())
    }
}

impl<K: Kmp> Drop for ServiceLock<'_, K> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            // Can't return a Result from Drop; this is the one place in the
            // pipeline that logs and swallows rather than propagating.
            error!(lock_va = self.lock_va, ?err, "failed to release service lock");
        }
    }
}
