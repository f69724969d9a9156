//! Narrow error type for kernel-memory and mailbox-transport failures.

use thiserror::Error;

/// Failures from the kernel memory primitive or the mailbox transport built
/// on top of it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// A `kread`/`kwrite` call targeted an address the backing
    /// implementation refuses to touch.
    #[error("kernel memory access refused at {kva:#x}")]
    AccessRefused {
        /// Kernel virtual address that was rejected.
        kva: u64,
    },

    /// Page-table walk during `kextract` hit a non-present entry.
    #[error("translation fault resolving {va:#x}")]
    TranslationFault {
        /// Virtual address that failed to translate.
        va: u64,
    },

    /// The mailbox transport submitted a request but the service never set
    /// the response-sense bit within the polling budget.
    #[error("mailbox response timed out on slot {slot:#x} after {polls} polls")]
    ResponseTimeout {
        /// Mailbox slot the request was issued on.
        slot: u8,
        /// Number of 1 ms polls performed before giving up.
        polls: u32,
    },

    /// The MMIO submit layer reported a non-zero status.
    #[error("mailbox submit failed on slot {slot:#x}: status {status}")]
    SubmitFailed {
        /// Mailbox slot the request was issued on.
        slot: u8,
        /// Sign-extended status code returned by the MMIO layer.
        status: i32,
    },
}
