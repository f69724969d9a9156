//! The decrypt-service capability: `LoadSelfSegment`/`LoadSelfBlock` over the
//! mailbox transport, staging ciphertext into and reading plaintext back out
//! of the two kernel scratch regions.

use self_core::Environment;
use tracing::trace;

use crate::error::KernelError;
use crate::kmp::Kmp;
use crate::mailbox::{MailboxRequest, MailboxTransport, DECRYPT_SLOT};

const CMD_LOAD_SELF_SEGMENT: u32 = 1;
const CMD_LOAD_SELF_BLOCK: u32 = 2;
const STAGE_CHUNK: usize = 0x1000;
const BLOCK_PAGES: usize = 4;
const PAGE_SIZE: u64 = 0x1000;

/// The two verbs the privileged crypto service exposes: whole-segment
/// decryption (used when a segment carries its own block-info table) and
/// single-block decryption (used when blocks are discovered or synthesized
/// by the Block Decryptor).
pub trait DecryptService {
    /// Decrypts `ciphertext` as a complete segment, returning
    /// `uncompressed_size` bytes of plaintext.
    fn load_self_segment(&self, ciphertext: &[u8], uncompressed_size: u64) -> Result<Vec<u8>, KernelError>;

    /// Decrypts one block (`block_size` bytes of `ciphertext`, the last
    /// block of a segment may be shorter) identified by `segment_id` and
    /// `block_index`, returning its plaintext.
    fn load_self_block(
        &self,
        segment_id: u32,
        block_index: u32,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KernelError>;
}

/// [`DecryptService`] built directly on the [`MailboxTransport`], staging
/// ciphertext through the kernel scratch regions named in the firmware
/// profile.
pub struct MailboxDecryptService<K, E> {
    kmp_for_scratch: K,
    transport: MailboxTransport<K, E>,
    scratch_a: u64,
    scratch_b: u64,
}

impl<K: Kmp + Clone, E: Environment> MailboxDecryptService<K, E> {
    /// Builds a service over `kmp` addressed at `scratch_a`/`scratch_b`,
    /// handing transport ownership of a clone of `kmp`.
    pub fn new(kmp: K, profile: self_core::firmware::FirmwareProfile, env: E) -> Self {
        let scratch_a = profile.scratch_a;
        let scratch_b = profile.scratch_b;
        Self {
            kmp_for_scratch: kmp.clone(),
            transport: MailboxTransport::new(kmp, profile, env),
            scratch_a,
            scratch_b,
        }
    }

    fn stage(&self, dst: u64, bytes: &[u8]) -> Result<(), KernelError> {
        for (i, chunk) in bytes.chunks(STAGE_CHUNK).enumerate() {
            self.kmp_for_scratch.kwrite(dst + (i * STAGE_CHUNK) as u64, chunk)?;
        }
        Ok(())
    }

    fn retrieve(&self, src: u64, len: usize) -> Result<Vec<u8>, KernelError> {
        let mut out = vec![0u8; len];
        for (i, chunk) in out.chunks_mut(STAGE_CHUNK).enumerate() {
            self.kmp_for_scratch.kread(src + (i * STAGE_CHUNK) as u64, chunk)?;
        }
        Ok(out)
    }
}

impl<K: Kmp + Clone, E: Environment> DecryptService for MailboxDecryptService<K, E> {
    fn load_self_segment(&self, ciphertext: &[u8], uncompressed_size: u64) -> Result<Vec<u8>, KernelError> {
        self.stage(self.scratch_b, ciphertext)?;

        let scratch_b_pa = self.transport_kextract(self.scratch_b)?;
        self.stage_chunk_table(scratch_b_pa, ciphertext.len() as u64)?;
        let scratch_a_pa = self.transport_kextract(self.scratch_a)?;

        let mut body = [0u8; 0x20];
        body[0..8].copy_from_slice(&scratch_a_pa.to_le_bytes());
        body[8..16].copy_from_slice(&uncompressed_size.to_le_bytes());

        let request = MailboxRequest {
            command: CMD_LOAD_SELF_SEGMENT,
            body,
            recv_len: uncompressed_size as usize,
        };
        trace!(uncompressed_size, "load_self_segment");
        self.transport.exchange(DECRYPT_SLOT, &request)?;
        self.retrieve(self.scratch_b, uncompressed_size as usize)
    }

    fn load_self_block(
        &self,
        segment_id: u32,
        block_index: u32,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KernelError> {
        self.stage(self.scratch_b, ciphertext)?;

        let mut body = [0u8; 0x20];
        body[0..4].copy_from_slice(&segment_id.to_le_bytes());
        body[4..8].copy_from_slice(&block_index.to_le_bytes());
        body[8..16].copy_from_slice(&(ciphertext.len() as u64).to_le_bytes());

        let request = MailboxRequest {
            command: CMD_LOAD_SELF_BLOCK,
            body,
            recv_len: BLOCK_PAGES * PAGE_SIZE as usize,
        };
        trace!(segment_id, block_index, "load_self_block");
        self.transport.exchange(DECRYPT_SLOT, &request)?;
        self.retrieve(self.scratch_a, BLOCK_PAGES * PAGE_SIZE as usize)
    }
}

impl<K: Kmp + Clone, E: Environment> MailboxDecryptService<K, E> {
    fn transport_kextract(&self, kva: u64) -> Result<u64, KernelError> {
        self.kmp_for_scratch.kextract(self.transport_profile(), kva)
    }

    fn transport_profile(&self) -> &self_core::firmware::FirmwareProfile {
        self.transport.profile()
    }

    fn stage_chunk_table(&self, first_pa: u64, data_size: u64) -> Result<(), KernelError> {
        let mut header = [0u8; 24];
        header[0..8].copy_from_slice(&first_pa.to_le_bytes());
        header[8..16].copy_from_slice(&1u64.to_le_bytes());
        header[16..24].copy_from_slice(&data_size.to_le_bytes());
        let mut entry = [0u8; 16];
        entry[0..8].copy_from_slice(&first_pa.to_le_bytes());
        entry[8..16].copy_from_slice(&data_size.to_le_bytes());

        self.kmp_for_scratch.kwrite(self.scratch_a, &header)?;
        self.kmp_for_scratch.kwrite(self.scratch_a + 24, &entry)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use self_core::firmware::FirmwareProfile;

    use super::*;

    #[derive(Clone, Default)]
    struct NoSleepEnv;

    impl Environment for NoSleepEnv {
        type Instant = Instant;
        fn now(&self) -> Instant {
            Instant::now()
        }
        fn sleep(&self, _duration: Duration) {}
    }

    #[derive(Clone)]
    struct EchoKmp {
        mem: Arc<Mutex<HashMap<u64, u8>>>,
    }

    impl EchoKmp {
        fn new() -> Self {
            Self { mem: Arc::new(Mutex::new(HashMap::new())) }
        }
    }

    impl Kmp for EchoKmp {
        fn kread(&self, kva: u64, dst: &mut [u8]) -> Result<(), KernelError> {
            let mem = self.mem.lock().expect("lock");
            for (i, b) in dst.iter_mut().enumerate() {
                *b = *mem.get(&(kva + i as u64)).unwrap_or(&0);
            }
            Ok(())
        }

        fn kwrite(&self, kva: u64, src: &[u8]) -> Result<(), KernelError> {
            let mut mem = self.mem.lock().expect("lock");
            for (i, b) in src.iter().enumerate() {
                mem.insert(kva + i as u64, *b);
            }
            // Acknowledge MMIO submission and flip the slot's response-sense
            // word, simulating a service that replies instantly.
            if kva == 0x9000 + 0x1_0564 {
                mem.insert(kva, 1);
                let sense_addr = 0x5000 + u64::from(DECRYPT_SLOT) * 0x100 + 0x1C;
                let sense = *mem.get(&sense_addr).unwrap_or(&0);
                mem.insert(sense_addr, sense.wrapping_add(1));
            }
            Ok(())
        }

        fn kextract(&self, _profile: &FirmwareProfile, kva: u64) -> Result<u64, KernelError> {
            Ok(kva)
        }
    }

    fn profile() -> FirmwareProfile {
        FirmwareProfile {
            auth_handle: 0,
            mailbox_mtx: 0,
            mailbox_base: 0x5000,
            service_lock: 0,
            mailbox_flags: 0x6000,
            mailbox_meta: 0x7000,
            mmio_base: 0x9000,
            dmap_ml4i: 0,
            dmap_dpi: 0,
            pml4_self_index: 0,
            message_id_counter: 0x8000,
            scratch_a: 0xA000,
            scratch_b: 0xB000,
        }
    }

    #[test]
    fn load_self_segment_stages_ciphertext_and_returns_plaintext_sized_buffer() {
        let kmp = EchoKmp::new();
        let service = MailboxDecryptService::new(kmp, profile(), NoSleepEnv);
        let ciphertext = vec![0x42u8; 0x40];
        let plaintext = service.load_self_segment(&ciphertext, 0x100).expect("segment decrypt");
        assert_eq!(plaintext.len(), 0x100);
    }

    #[test]
    fn load_self_block_returns_a_four_page_buffer() {
        let kmp = EchoKmp::new();
        let service = MailboxDecryptService::new(kmp, profile(), NoSleepEnv);
        let ciphertext = vec![0x11u8; BLOCK_PAGES * PAGE_SIZE as usize];
        let plaintext = service.load_self_block(3, 0, &ciphertext).expect("block decrypt");
        assert_eq!(plaintext.len(), ciphertext.len());
    }
}
