//! Pipeline configuration surface.
//!
//! Loads from TOML (superseding the source's `config.ini`); every key,
//! type, and default matches the original surface exactly. Partial files
//! are accepted: any field not mentioned falls back to its default via
//! `#[serde(default)]`.

use serde::Deserialize;

/// The ten `(target_v5, target_v4)` pairs selected by `backport_level`,
/// indexed `level - 1`.
pub const TOOLCHAIN_VERSION_TABLE: [(u32, u32); 10] = [
    (0x0100_0050, 0x0759_0001),
    (0x0200_0009, 0x0805_0001),
    (0x0300_0027, 0x0854_0001),
    (0x0400_0031, 0x0904_0001),
    (0x0500_0033, 0x0959_0001),
    (0x0600_0038, 0x1009_0001),
    (0x0700_0038, 0x1059_0001),
    (0x0800_0041, 0x1109_0001),
    (0x0900_0040, 0x1159_0001),
    (0x1000_0040, 0x1209_0001),
];

fn default_true() -> bool {
    true
}

fn default_backport_level() -> u8 {
    4
}

/// Recognized configuration surface (see the external interfaces table).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Run the decrypt pipeline.
    pub decrypter: bool,
    /// Enable the Toolchain-Version Patcher.
    pub enable_backport: bool,
    /// Row (1..=10) selected from [`TOOLCHAIN_VERSION_TABLE`].
    pub backport_level: u8,
    /// Explicit override for the target PS5 SDK version.
    pub min_ps5_sdk_version: Option<u32>,
    /// Explicit override for the target PS4 SDK version.
    pub min_ps4_sdk_version: Option<u32>,
    /// Enable the log sink.
    pub enable_logging: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            decrypter: default_true(),
            enable_backport: default_true(),
            backport_level: default_backport_level(),
            min_ps5_sdk_version: None,
            min_ps4_sdk_version: None,
            enable_logging: default_true(),
        }
    }
}

impl PipelineConfig {
    /// Resolves the effective `(target_v5, target_v4)` pair this
    /// configuration selects for the Toolchain-Version Patcher.
    ///
    /// If either override is present, both are used — the missing one falls
    /// back to the default level's row — and `backport_level` is ignored
    /// entirely.
    #[must_use]
    pub fn resolve_toolchain_targets(&self) -> (u32, u32) {
        let default_row = TOOLCHAIN_VERSION_TABLE[usize::from(default_backport_level() - 1)];
        if self.min_ps5_sdk_version.is_some() || self.min_ps4_sdk_version.is_some() {
            return (
                self.min_ps5_sdk_version.unwrap_or(default_row.0),
                self.min_ps4_sdk_version.unwrap_or(default_row.1),
            );
        }
        let index = self.backport_level.clamp(1, 10) - 1;
        TOOLCHAIN_VERSION_TABLE[usize::from(index)]
    }
}
