//! Kernel memory primitive contract, the mailbox transport built on it, the
//! decrypt-service capability, and the process-wide service lock.
//!
//! Nothing in this crate touches the SELF/ELF container formats directly —
//! that's `self-proto`'s job. This crate is the boundary between the
//! pipeline's pure logic and the privileged kernel it talks to.

mod error;
pub mod kmp;
pub mod mailbox;
pub mod service;
pub mod service_lock;

pub use error::KernelError;
pub use kmp::Kmp;
pub use mailbox::{MailboxRequest, MailboxResponse, MailboxTransport, DECRYPT_SLOT};
pub use service::{DecryptService, MailboxDecryptService};
pub use service_lock::ServiceLock;
