//! Command-line entry point: decrypt and re-wrap every candidate file under
//! a source tree, driven by a TOML config file and a handful of CLI
//! overrides.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use self_cli::runtime::{self, RunArgs};
use self_core::config::PipelineConfig;
use self_proto::self_format::{SELF_MAGIC_PS4, SELF_MAGIC_PS5};

/// Target platform, selecting the Fake-Sign Encoder's container magic.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Platform {
    /// PlayStation 4.
    Ps4,
    /// PlayStation 5.
    Ps5,
}

impl Platform {
    fn magic(self) -> u32 {
        match self {
            Self::Ps4 => SELF_MAGIC_PS4,
            Self::Ps5 => SELF_MAGIC_PS5,
        }
    }
}

/// Decrypts and re-wraps SELF containers under a source tree.
#[derive(Parser, Debug)]
#[command(name = "self-cli")]
#[command(about = "SELF decryption and repackaging pipeline")]
#[command(version)]
struct Args {
    /// Directory tree to walk for candidate files.
    source: PathBuf,

    /// Directory tree to write decrypted/re-wrapped output into.
    output: PathBuf,

    /// Path to a TOML configuration file. Missing fields fall back to
    /// documented defaults; a missing file is equivalent to an empty one.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Unix socket path of the kernel-access helper.
    #[arg(long, default_value = "/tmp/self-kmp.sock")]
    kmp_socket: PathBuf,

    /// Base kernel virtual address the firmware offset table is relative
    /// to, in hex (e.g. `0xffffffff82200000`).
    #[arg(long, value_parser = parse_hex_u64)]
    kernel_base: u64,

    /// Running firmware version, in hex (e.g. `0x06000041`).
    #[arg(long, value_parser = parse_hex_u32)]
    firmware_version: u32,

    /// Target platform.
    #[arg(long, value_enum, default_value_t = Platform::Ps5)]
    platform: Platform,

    /// Override: run the decrypt pipeline.
    #[arg(long)]
    decrypter: Option<bool>,
    /// Override: enable the Toolchain-Version Patcher.
    #[arg(long)]
    enable_backport: Option<bool>,
    /// Override: row (1..=10) selected from the toolchain version table.
    #[arg(long)]
    backport_level: Option<u8>,
    /// Override: explicit target PS5 SDK version, in hex.
    #[arg(long, value_parser = parse_hex_u32)]
    min_ps5_sdk_version: Option<u32>,
    /// Override: explicit target PS4 SDK version, in hex.
    #[arg(long, value_parser = parse_hex_u32)]
    min_ps4_sdk_version: Option<u32>,
    /// Override: enable the log sink.
    #[arg(long)]
    enable_logging: Option<bool>,
}

fn parse_hex_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
}

fn parse_hex_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    u32::from_str_radix(s.trim_start_matches("0x"), 16)
}

fn apply_overrides(mut config: PipelineConfig, args: &Args) -> PipelineConfig {
    if let Some(v) = args.decrypter {
        config.decrypter = v;
    }
    if let Some(v) = args.enable_backport {
        config.enable_backport = v;
    }
    if let Some(v) = args.backport_level {
        config.backport_level = v;
    }
    if args.min_ps5_sdk_version.is_some() {
        config.min_ps5_sdk_version = args.min_ps5_sdk_version;
    }
    if args.min_ps4_sdk_version.is_some() {
        config.min_ps4_sdk_version = args.min_ps4_sdk_version;
    }
    if let Some(v) = args.enable_logging {
        config.enable_logging = v;
    }
    config
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match runtime::load_config(args.config.as_deref()) {
        Ok(config) => apply_overrides(config, &args),
        Err(err) => {
            eprintln!("self-cli: {err}");
            return ExitCode::FAILURE;
        },
    };

    runtime::install_subscriber(config.enable_logging);

    let run_args = RunArgs {
        source_root: args.source.clone(),
        output_root: args.output.clone(),
        kmp_socket: args.kmp_socket.clone(),
        kernel_base: args.kernel_base,
        firmware_version: args.firmware_version,
        platform_magic: args.platform.magic(),
        config,
    };

    match runtime::run(run_args) {
        Ok(summary) => {
            println!(
                "processed {} skipped {} failed {}",
                summary.processed, summary.skipped, summary.failed
            );
            if summary.failed > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        },
        Err(err) => {
            eprintln!("self-cli: {err}");
            ExitCode::FAILURE
        },
    }
}
