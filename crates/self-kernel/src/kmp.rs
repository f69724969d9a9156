//! The Kernel Memory Primitive contract.
//!
//! `kread`/`kwrite` are the genuine external dependency — raw access to
//! kernel virtual memory, obtained however the host environment obtains it.
//! `kextract` (virtual-to-physical translation) is fully specified by the
//! container format's design and is provided here as a default method built
//! only on top of `kread`, so a minimal `Kmp` implementation needs to supply
//! nothing but the two raw accessors.

use self_core::firmware::FirmwareProfile;

use crate::error::KernelError;

const PAGE_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const LARGE_PAGE_MASK: u64 = 0x000F_FFFF_FFE0_0000;
const PRESENT_BIT: u64 = 1;
const PAGE_SIZE_BIT: u64 = 1 << 7;
const DMAP_SPAN: u64 = 1 << 39;
const RECURSIVE_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Opaque capability over kernel virtual memory: `kread`, `kwrite`, and
/// (derived) `kextract`.
///
/// Implementations in a hosted test environment can plug a simulated memory
/// with an instrumented `kread`/`kwrite` pair (see `self-harness`); a
/// production implementation wraps whatever kernel read/write primitive the
/// host platform exposes.
///
/// The pipeline is single-threaded and cooperative throughout, so this trait
/// carries no `Send`/`Sync` requirement — implementations are free to use
/// interior mutability without atomics.
pub trait Kmp {
    /// Reads `dst.len()` bytes from kernel virtual address `kva`.
    fn kread(&self, kva: u64, dst: &mut [u8]) -> Result<(), KernelError>;

    /// Writes `src` to kernel virtual address `kva`.
    fn kwrite(&self, kva: u64, src: &[u8]) -> Result<(), KernelError>;

    /// Translates a kernel virtual address to its physical address.
    ///
    /// First checks the direct map (`profile.dmap_ml4i`/`dmap_dpi`); if
    /// `kva` falls outside the direct-mapped 2^39-byte window, walks the
    /// recursive self-mapped page directory to find the PDE, following
    /// through to the PTE (via the direct map, since by then we hold a
    /// physical page-table address) unless the PDE itself maps a large
    /// (2 MiB) page.
    fn kextract(&self, profile: &FirmwareProfile, kva: u64) -> Result<u64, KernelError> {
        let dmap_base = (profile.dmap_dpi << 30) | (profile.dmap_ml4i << 39) | RECURSIVE_BASE;
        if kva >= dmap_base && kva < dmap_base.wrapping_add(DMAP_SPAN) {
            return Ok(kva - dmap_base);
        }

        let self_idx = profile.pml4_self_index;
        let pde_va = ((self_idx << 39) | (self_idx << 30) | RECURSIVE_BASE).wrapping_add(8 * ((kva >> 21) & 0x7FFF_FFF));
        let pde = self.read_u64(pde_va)?;
        if pde & PRESENT_BIT == 0 {
            return Err(KernelError::TranslationFault { va: kva });
        }
        if pde & PAGE_SIZE_BIT != 0 {
            return Ok((pde & LARGE_PAGE_MASK) | (kva & 0x1F_FFFF));
        }

        let pt_pa = pde & PAGE_MASK;
        let pte_va = dmap_base + pt_pa + 8 * ((kva >> 12) & 0x1FF);
        let pte = self.read_u64(pte_va)?;
        if pte & PRESENT_BIT == 0 {
            return Err(KernelError::TranslationFault { va: kva });
        }
        Ok((pte & PAGE_MASK) | (kva & 0xFFF))
    }

    /// Convenience: reads a little-endian `u64` via `kread`.
    fn read_u64(&self, kva: u64) -> Result<u64, KernelError> {
        let mut buf = [0u8; 8];
        self.kread(kva, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;

    use self_core::firmware::FirmwareProfile;

    use super::*;

    /// Minimal in-memory `Kmp` for exercising `kextract`'s two branches.
    struct FakeKmp {
        pages: RefCell<HashMap<u64, [u8; 8]>>,
    }

    impl Kmp for FakeKmp {
        fn kread(&self, kva: u64, dst: &mut [u8]) -> Result<(), KernelError> {
            let page = self
                .pages
                .borrow()
                .get(&kva)
                .copied()
                .ok_or(KernelError::AccessRefused { kva })?;
            dst.copy_from_slice(&page[..dst.len()]);
            Ok(())
        }

        fn kwrite(&self, _kva: u64, _src: &[u8]) -> Result<(), KernelError> {
            unimplemented!("not needed for these tests")
        }
    }

    fn profile() -> FirmwareProfile {
        FirmwareProfile {
            auth_handle: 0,
            mailbox_mtx: 0,
            mailbox_base: 0,
            service_lock: 0,
            mailbox_flags: 0,
            mailbox_meta: 0,
            mmio_base: 0,
            dmap_ml4i: 0x100,
            dmap_dpi: 0,
            pml4_self_index: 0x1FF,
            message_id_counter: 0,
            scratch_a: 0,
            scratch_b: 0,
        }
    }

    #[test]
    fn direct_map_address_subtracts_dmap_base() {
        let kmp = FakeKmp {
            pages: RefCell::new(HashMap::new()),
        };
        let p = profile();
        let dmap_base = (p.dmap_dpi << 30) | (p.dmap_ml4i << 39) | RECURSIVE_BASE;
        let pa = kmp.kextract(&p, dmap_base + 0x1234).expect("direct map hit");
        assert_eq!(pa, 0x1234);
    }

    #[test]
    fn large_page_pde_resolves_without_pte_walk() {
        let p = profile();
        let kva = 0x1000_0000u64;
        let pde_va = ((p.pml4_self_index << 39) | (p.pml4_self_index << 30) | RECURSIVE_BASE)
            .wrapping_add(8 * ((kva >> 21) & 0x7FFF_FFF));
        let large_page_pa = 0x200_0000u64; // 2 MiB aligned
        let pde = large_page_pa | PAGE_SIZE_BIT | PRESENT_BIT;
        let mut pages = HashMap::new();
        pages.insert(pde_va, pde.to_le_bytes());
        let kmp = FakeKmp {
            pages: RefCell::new(pages),
        };
        let pa = kmp.kextract(&p, kva).expect("large page hit");
        assert_eq!(pa, large_page_pa | (kva & 0x1F_FFFF));
    }

    #[test]
    fn non_present_pde_is_a_translation_fault() {
        let p = profile();
        let kva = 0x2000_0000u64;
        let kmp = FakeKmp {
            pages: RefCell::new(HashMap::new()),
        };
        let err = kmp.kextract(&p, kva).unwrap_err();
        assert_eq!(err, KernelError::TranslationFault { va: kva });
    }
}
