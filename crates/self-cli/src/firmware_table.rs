//! The hand-maintained firmware offset table, in kernel-base-relative form.
//!
//! Every row below is a reverse-engineered kernel-data-section offset for
//! one firmware release family, the same shape the original reference
//! implementation's per-version `switch` carried — ten case-groups in all,
//! down to the 0x7000/0x7200 split where only the auth-manager handle moves.
//! Two of these offsets
//! (`dmpml4i`, `dmpdpi`) don't name addresses directly — they name where in
//! kernel memory the *current* direct-map page indices are stored, so
//! resolving a profile costs two extra `kread`s beyond simple addition.

use self_core::firmware::{FirmwareOffsetTable, FirmwareProfile};
use self_kernel::{KernelError, Kmp};

/// Kernel virtual address the direct map is mapped through, orthogonal to
/// the per-firmware offset table (architectural, not version-specific).
const DMAP_RECURSIVE_BASE: u64 = 0xFFFF_8000_0000_0000;

/// MMIO command/status window's fixed displacement from the direct map
/// base.
const MMIO_DMAP_DISPLACEMENT: u64 = 0xE050_0000;

struct OffsetRow {
    min_version_hi: u16,
    max_version_hi: u16,
    auth_handle: u64,
    mailbox_mtx: u64,
    mailbox_base: u64,
    service_lock: u64,
    mailbox_flags: u64,
    mailbox_meta: u64,
    dmpml4i: u64,
    dmpdpi: u64,
    pml4pml4i: u64,
    message_id_counter: u64,
    datacave_1: u64,
    datacave_2: u64,
}

/// Reverse-engineered kernel-base-relative offsets, one row per firmware
/// release family.
const OFFSET_ROWS: &[OffsetRow] = &[
    OffsetRow {
        min_version_hi: 0x0300,
        max_version_hi: 0x0321,
        auth_handle: 0x00C9_EE50,
        mailbox_mtx: 0x0271_2A98,
        mailbox_base: 0x0271_2AA0,
        service_lock: 0x0271_2AA8,
        mailbox_flags: 0x02CF_5F98,
        mailbox_meta: 0x02CF_5D38,
        dmpml4i: 0x031B_E4A0,
        dmpdpi: 0x031B_E4A4,
        pml4pml4i: 0x031B_E1FC,
        message_id_counter: 0x0000_8000,
        datacave_1: 0x0872_0000,
        datacave_2: 0x0872_4000,
    },
    OffsetRow {
        min_version_hi: 0x0400,
        max_version_hi: 0x0451,
        auth_handle: 0x00D0_FBB0,
        mailbox_mtx: 0x0279_2AB8,
        mailbox_base: 0x0279_2AC0,
        service_lock: 0x0279_2AC8,
        mailbox_flags: 0x02D8_DFC0,
        mailbox_meta: 0x02D8_DD60,
        dmpml4i: 0x0325_7D00,
        dmpdpi: 0x0325_7D04,
        pml4pml4i: 0x0325_7A5C,
        message_id_counter: 0x0000_8000,
        datacave_1: 0x0872_0000,
        datacave_2: 0x0872_4000,
    },
    OffsetRow {
        min_version_hi: 0x0500,
        max_version_hi: 0x0555,
        auth_handle: 0x0DFF_410,
        mailbox_mtx: 0x028C_3038,
        mailbox_base: 0x028C_3040,
        service_lock: 0x028C_3048,
        mailbox_flags: 0x02EA_DFC0,
        mailbox_meta: 0x02EA_DD60,
        dmpml4i: 0x0339_8D24,
        dmpdpi: 0x0339_8D28,
        pml4pml4i: 0x0339_7A2C,
        message_id_counter: 0x0427_0000,
        datacave_1: 0x0873_0000,
        datacave_2: 0x0873_4000,
    },
    OffsetRow {
        min_version_hi: 0x0600,
        max_version_hi: 0x0665,
        auth_handle: 0x0E1F_8D0,
        mailbox_mtx: 0x0280_F3A8,
        mailbox_base: 0x0280_F3B0,
        service_lock: 0x0280_F3B8,
        mailbox_flags: 0x02DF_9FC0,
        mailbox_meta: 0x02DF_9D60,
        dmpml4i: 0x032E_45F4,
        dmpdpi: 0x032E_45F8,
        pml4pml4i: 0x032E_32FC,
        message_id_counter: 0x0427_0000,
        datacave_1: 0x0873_0000,
        datacave_2: 0x0873_4000,
    },
    OffsetRow {
        min_version_hi: 0x0700,
        max_version_hi: 0x0701,
        auth_handle: 0x0E20_270,
        mailbox_mtx: 0x027F_F808,
        mailbox_base: 0x027F_F810,
        service_lock: 0x027F_F818,
        mailbox_flags: 0x02CC_DFC0,
        mailbox_meta: 0x02CC_DD60,
        dmpml4i: 0x02E2_CAE4,
        dmpdpi: 0x02E2_CAE8,
        pml4pml4i: 0x02E2_B79C,
        message_id_counter: 0x0427_0000,
        datacave_1: 0x0506_0000,
        datacave_2: 0x0506_4000,
    },
    OffsetRow {
        min_version_hi: 0x0720,
        max_version_hi: 0x0761,
        auth_handle: 0x0E20_330,
        mailbox_mtx: 0x027F_F808,
        mailbox_base: 0x027F_F810,
        service_lock: 0x027F_F818,
        mailbox_flags: 0x02CC_DFC0,
        mailbox_meta: 0x02CC_DD60,
        dmpml4i: 0x02E2_CAE4,
        dmpdpi: 0x02E2_CAE8,
        pml4pml4i: 0x02E2_B79C,
        message_id_counter: 0x0427_0000,
        datacave_1: 0x0506_0000,
        datacave_2: 0x0506_4000,
    },
    OffsetRow {
        min_version_hi: 0x0800,
        max_version_hi: 0x0860,
        auth_handle: 0x0E20_3C0,
        mailbox_mtx: 0x027F_F888,
        mailbox_base: 0x027F_F890,
        service_lock: 0x027F_F898,
        mailbox_flags: 0x02CE_A820,
        mailbox_meta: 0x02CE_A5C0,
        dmpml4i: 0x02E4_8AE4,
        dmpdpi: 0x02E4_8AE8,
        pml4pml4i: 0x02E4_779C,
        message_id_counter: 0x0427_0000,
        datacave_1: 0x0506_0000,
        datacave_2: 0x0506_4000,
    },
    OffsetRow {
        min_version_hi: 0x0900,
        max_version_hi: 0x0960,
        auth_handle: 0x00DB_8D60,
        mailbox_mtx: 0x026E_71F8,
        mailbox_base: 0x026E_7200,
        service_lock: 0x026E_7208,
        mailbox_flags: 0x02BC_A860,
        mailbox_meta: 0x02BC_A600,
        dmpml4i: 0x02D2_8E14,
        dmpdpi: 0x02D2_8E18,
        pml4pml4i: 0x02D2_79CC,
        message_id_counter: 0x0427_0000,
        datacave_1: 0x0506_0000,
        datacave_2: 0x0506_4000,
    },
    OffsetRow {
        min_version_hi: 0x1000,
        max_version_hi: 0x1060,
        auth_handle: 0x00DB_8DF0,
        mailbox_mtx: 0x026F_71F8,
        mailbox_base: 0x026F_7200,
        service_lock: 0x026F_7208,
        mailbox_flags: 0x02BE_E860,
        mailbox_meta: 0x02BE_E600,
        dmpml4i: 0x02CF_1194,
        dmpdpi: 0x02CF_1198,
        pml4pml4i: 0x02CE_FD4C,
        message_id_counter: 0x0427_0000,
        datacave_1: 0x0506_0000,
        datacave_2: 0x0506_4000,
    },
];

/// Builds a [`FirmwareOffsetTable`] that resolves `kernel_base`-relative
/// rows against a supplied `kernel_base`, once `kmp` is available to read
/// the two direct-map indices.
///
/// This can't be a plain [`FirmwareOffsetTable`] lookup (that type returns
/// an already-complete [`FirmwareProfile`] with no further I/O): resolving
/// `dmpml4i`/`dmpdpi` genuinely requires a kernel read against the running
/// instance, so this function does that read eagerly for every row rather
/// than deferring it into the table's `resolve`.
pub fn resolve_profile<K: Kmp>(kmp: &K, kernel_base: u64, firmware_version: u32) -> Result<FirmwareProfile, KernelError> {
    let version_hi = (firmware_version >> 16) as u16;
    let row = OFFSET_ROWS
        .iter()
        .find(|row| (row.min_version_hi..=row.max_version_hi).contains(&version_hi))
        .ok_or(KernelError::AccessRefused { kva: kernel_base })?;

    let dmap_ml4i = u64::from(kmp.read_u64(kernel_base + row.dmpml4i)? as u32);
    let dmap_dpi = u64::from(kmp.read_u64(kernel_base + row.dmpdpi)? as u32);
    let pml4_self_index = u64::from(kmp.read_u64(kernel_base + row.pml4pml4i)? as u32);

    let dmap_base = (dmap_dpi << 30) | (dmap_ml4i << 39) | DMAP_RECURSIVE_BASE;

    Ok(FirmwareProfile {
        auth_handle: kernel_base + row.auth_handle,
        mailbox_mtx: kernel_base + row.mailbox_mtx,
        mailbox_base: kernel_base + row.mailbox_base,
        service_lock: kernel_base + row.service_lock,
        mailbox_flags: kernel_base + row.mailbox_flags,
        mailbox_meta: kernel_base + row.mailbox_meta,
        mmio_base: dmap_base + MMIO_DMAP_DISPLACEMENT,
        dmap_ml4i,
        dmap_dpi,
        pml4_self_index,
        message_id_counter: kernel_base + row.message_id_counter,
        scratch_a: kernel_base + row.datacave_1,
        scratch_b: kernel_base + row.datacave_2,
    })
}

/// Builds the `self-core` [`FirmwareOffsetTable`] form of the hand-maintained
/// rows for callers (tests, diagnostics) that want the closed-match-table
/// interface directly rather than this module's eager resolver. Profiles
/// built this way leave `dmap_ml4i`/`dmap_dpi`/`pml4_self_index`/`mmio_base`
/// zeroed, since those fields require a live `kread` to resolve.
#[must_use]
pub fn static_table(kernel_base: u64) -> FirmwareOffsetTable {
    FirmwareOffsetTable::new(
        OFFSET_ROWS
            .iter()
            .map(|row| {
                (
                    row.min_version_hi,
                    row.max_version_hi,
                    FirmwareProfile {
                        auth_handle: kernel_base + row.auth_handle,
                        mailbox_mtx: kernel_base + row.mailbox_mtx,
                        mailbox_base: kernel_base + row.mailbox_base,
                        service_lock: kernel_base + row.service_lock,
                        mailbox_flags: kernel_base + row.mailbox_flags,
                        mailbox_meta: kernel_base + row.mailbox_meta,
                        mmio_base: 0,
                        dmap_ml4i: 0,
                        dmap_dpi: 0,
                        pml4_self_index: 0,
                        message_id_counter: kernel_base + row.message_id_counter,
                        scratch_a: kernel_base + row.datacave_1,
                        scratch_b: kernel_base + row.datacave_2,
                    },
                )
            })
            .collect(),
    )
}
