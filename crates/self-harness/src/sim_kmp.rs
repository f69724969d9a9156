//! In-memory [`Kmp`] fake.
//!
//! Generalizes the byte-addressed-map fakes `self-kernel`'s own unit tests
//! build ad hoc (see `RecordingKmp` in `service_lock.rs`, `InstantReplyKmp`
//! in `mailbox.rs`) into a reusable, cloneable fixture other crates can
//! drive `ServiceLock`, `MailboxTransport`, and `MailboxDecryptService`
//! against without a real kernel. `kextract` is overridden to the identity
//! function, exactly as those ad hoc fakes do: a flat simulated memory has
//! no page tables to walk, and nothing in the pipeline's own logic cares
//! how `kextract`'s translation is performed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use self_core::firmware::FirmwareProfile;
use self_kernel::{KernelError, Kmp};

/// An in-memory, byte-addressed [`Kmp`]. Cloning shares the same backing
/// memory, the same way a real `Kmp` clone shares one underlying handle to
/// the kernel.
#[derive(Debug, Clone, Default)]
pub struct SimKmp {
    mem: Arc<Mutex<HashMap<u64, u8>>>,
}

impl SimKmp {
    /// Creates an empty simulated address space (every address reads as
    /// zero until written).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds `kva` with `value`, for test setup that needs to pre-populate
    /// a word (a message-id counter, a service-lock word, ...) before the
    /// code under test runs.
    pub fn seed_u64(&self, kva: u64, value: u64) {
        self.kwrite(kva, &value.to_le_bytes()).expect("SimKmp writes never fail");
    }

    /// Reads back a `u64` written with [`Self::seed_u64`] or by the code
    /// under test, for assertions.
    #[must_use]
    pub fn peek_u64(&self, kva: u64) -> u64 {
        self.read_u64(kva).expect("SimKmp reads never fail")
    }
}

impl Kmp for SimKmp {
    fn kread(&self, kva: u64, dst: &mut [u8]) -> Result<(), KernelError> {
        let mem = self.mem.lock().expect("SimKmp mutex poisoned");
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = *mem.get(&(kva + i as u64)).unwrap_or(&0);
        }
        Ok(())
    }

    fn kwrite(&self, kva: u64, src: &[u8]) -> Result<(), KernelError> {
        let mut mem = self.mem.lock().expect("SimKmp mutex poisoned");
        for (i, byte) in src.iter().enumerate() {
            mem.insert(kva + i as u64, *byte);
        }
        Ok(())
    }

    fn kextract(&self, _profile: &FirmwareProfile, kva: u64) -> Result<u64, KernelError> {
        Ok(kva)
    }
}
