//! In-memory [`DecryptService`] fake.
//!
//! The real service lives behind the mailbox transport and a privileged
//! kernel component neither this crate nor `self-pipeline` can stand up in
//! a test. `SimDecryptService` skips the mailbox entirely and answers
//! `load_self_segment`/`load_self_block` directly from a pluggable
//! transform, the same shortcut `self-pipeline`'s own unit tests take with
//! their ad hoc `EchoBlockService`/`FixedService` fakes (`bd.rs`, `sd.rs`) —
//! generalized here so `self-harness` callers can drive a full
//! `PipelineDriver` run without reimplementing one per test.

use std::sync::atomic::{AtomicU32, Ordering};

use self_kernel::{DecryptService, KernelError};

/// A [`DecryptService`] whose responses come from a caller-supplied
/// transform rather than a real crypto engine, plus an optional failure
/// budget for exercising the pipeline's retry paths.
pub struct SimDecryptService<F> {
    transform: F,
    fail_next: AtomicU32,
}

impl<F> SimDecryptService<F>
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync,
{
    /// Builds a service that always succeeds, answering every call with
    /// `transform` applied to the ciphertext it was given.
    pub fn new(transform: F) -> Self {
        Self { transform, fail_next: AtomicU32::new(0) }
    }

    /// Like [`Self::new`], but the first `failures` calls (segment or
    /// block, whichever comes first) return [`KernelError::ResponseTimeout`]
    /// before the service starts answering normally.
    pub fn with_failures(transform: F, failures: u32) -> Self {
        Self { transform, fail_next: AtomicU32::new(failures) }
    }

    fn maybe_fail(&self) -> Option<KernelError> {
        let remaining = self.fail_next.load(Ordering::Relaxed);
        if remaining == 0 {
            return None;
        }
        self.fail_next.fetch_sub(1, Ordering::Relaxed);
        Some(KernelError::ResponseTimeout { slot: 0xE, polls: 500 })
    }
}

/// Identity transform: plaintext equals ciphertext. Useful when a test only
/// cares that the right bytes ended up in the right place, not that they
/// were meaningfully "decrypted."
#[must_use]
pub fn identity_transform(ciphertext: &[u8]) -> Vec<u8> {
    ciphertext.to_vec()
}

impl<F> DecryptService for SimDecryptService<F>
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync,
{
    fn load_self_segment(&self, ciphertext: &[u8], uncompressed_size: u64) -> Result<Vec<u8>, KernelError> {
        if let Some(err) = self.maybe_fail() {
            return Err(err);
        }
        let mut plaintext = (self.transform)(ciphertext);
        plaintext.resize(uncompressed_size as usize, 0);
        Ok(plaintext)
    }

    fn load_self_block(&self, _segment_id: u32, _block_index: u32, ciphertext: &[u8]) -> Result<Vec<u8>, KernelError> {
        if let Some(err) = self.maybe_fail() {
            return Err(err);
        }
        Ok((self.transform)(ciphertext))
    }
}
