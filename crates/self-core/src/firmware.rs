//! Firmware Offset Table: a closed set of firmware-version-to-kernel-offset
//! profiles.
//!
//! The mailbox transport and kernel memory primitive need a handful of
//! kernel-resident addresses that move between firmware releases. This
//! table is intentionally closed (a match over known version ranges, not a
//! runtime-loaded database): a new profile is added only when a new
//! firmware release has been reverse engineered, never synthesized at
//! runtime.

/// Kernel offsets a firmware release exposes the mailbox protocol and key
/// handle at. Immutable for the duration of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareProfile {
    /// Kernel virtual address of the `authmgr` service-manager handle.
    pub auth_handle: u64,
    /// Kernel virtual address of the mailbox mutex.
    pub mailbox_mtx: u64,
    /// Kernel virtual address of the mailbox slot array base.
    pub mailbox_base: u64,
    /// Kernel virtual address of the platform-wide service lock word.
    pub service_lock: u64,
    /// Kernel virtual address of the mailbox-flags bitmap.
    pub mailbox_flags: u64,
    /// Kernel virtual address of the mailbox metadata-record array.
    pub mailbox_meta: u64,
    /// Kernel virtual address of the MMIO transport's command/status window.
    pub mmio_base: u64,
    /// Direct-map `PML4` index (`dmap_ml4i`).
    pub dmap_ml4i: u64,
    /// Direct-map `PDPT` index (`dmap_dpi`).
    pub dmap_dpi: u64,
    /// Self-referencing `PML4` index used for the recursive page-table walk.
    pub pml4_self_index: u64,
    /// Kernel virtual address of the monotonic message-id counter.
    pub message_id_counter: u64,
    /// First kernel scratch region (at least 16 KiB).
    pub scratch_a: u64,
    /// Second kernel scratch region (at least 16 KiB).
    pub scratch_b: u64,
}

/// One row of the firmware offset table, keyed by the inclusive range of the
/// top 16 bits of the running firmware version it applies to.
struct FirmwareRow {
    min_version_hi: u16,
    max_version_hi: u16,
    profile: FirmwareProfile,
}

/// Closed lookup from a running firmware version to its [`FirmwareProfile`].
pub struct FirmwareOffsetTable {
    rows: Vec<FirmwareRow>,
}

impl FirmwareOffsetTable {
    /// Builds the table from explicit `(min_hi, max_hi, profile)` rows.
    ///
    /// Production callers populate this once at startup from a reverse
    /// engineered constant table; tests build small tables directly.
    #[must_use]
    pub fn new(rows: Vec<(u16, u16, FirmwareProfile)>) -> Self {
        Self {
            rows: rows
                .into_iter()
                .map(|(min_version_hi, max_version_hi, profile)| FirmwareRow {
                    min_version_hi,
                    max_version_hi,
                    profile,
                })
                .collect(),
        }
    }

    /// Resolves `firmware_version`'s profile, keyed by its top 16 bits.
    /// Returns `None` for an unrecognized firmware version; the pipeline
    /// driver turns that into `SelfError::UnsupportedFirmware` and refuses
    /// to proceed.
    #[must_use]
    pub fn resolve(&self, firmware_version: u32) -> Option<&FirmwareProfile> {
        let version_hi = (firmware_version >> 16) as u16;
        self.rows
            .iter()
            .find(|row| (row.min_version_hi..=row.max_version_hi).contains(&version_hi))
            .map(|row| &row.profile)
    }
}
