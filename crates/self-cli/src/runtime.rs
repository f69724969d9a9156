//! Startup sequence and main run loop.
//!
//! Load config, install the tracing subscriber, acquire the kernel service
//! lock, and run the pipeline driver to completion against one source
//! tree. This is the only impure code in the crate; everything else in the
//! workspace is pure logic injected with capability traits.

use std::io;
use std::path::PathBuf;

use self_core::config::PipelineConfig;
use self_core::env::SystemEnvironment;
use self_core::progress::TracingProgressSink;
use self_core::SelfError;
use self_kernel::service::MailboxDecryptService;
use self_kernel::service_lock::ServiceLock;
use self_pipeline::{PipelineDriver, RunSummary};
use thiserror::Error;

use crate::firmware_table;
use crate::kmp_socket::SocketKmp;

/// Runtime errors outside the per-file pipeline error model: everything
/// that can go wrong before a single file is even reached.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Couldn't connect to the kernel-access helper.
    #[error("failed to connect to kernel-access helper at {path}")]
    KmpConnect {
        /// Socket path that was attempted.
        path: PathBuf,
    },
    /// The running firmware has no entry in the offset table.
    #[error("unsupported firmware version {version:#010x}")]
    UnsupportedFirmware {
        /// Firmware version that failed to resolve.
        version: u32,
    },
    /// Failed to acquire the service lock.
    #[error("failed to acquire the service lock")]
    ServiceLock,
    /// Config file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
    /// The pipeline run itself failed fatally.
    #[error(transparent)]
    Pipeline(#[from] SelfError),
}

/// Fully resolved arguments for one pipeline run.
pub struct RunArgs {
    /// Directory tree to walk for candidate files.
    pub source_root: PathBuf,
    /// Directory tree decrypted/patched/re-wrapped output is written to.
    pub output_root: PathBuf,
    /// Path to the kernel-access helper's Unix socket.
    pub kmp_socket: PathBuf,
    /// Base kernel virtual address the firmware offset table's rows are
    /// relative to.
    pub kernel_base: u64,
    /// Running firmware version, used to select an offset table row.
    pub firmware_version: u32,
    /// Target platform's SELF magic, used by the Fake-Sign Encoder.
    pub platform_magic: u32,
    /// Effective pipeline configuration (config file, overridden by CLI
    /// flags).
    pub config: PipelineConfig,
}

/// Loads `path` as a partial TOML `PipelineConfig`, falling back to
/// defaults for a missing file.
pub fn load_config(path: Option<&std::path::Path>) -> Result<PipelineConfig, RuntimeError> {
    let Some(path) = path else {
        return Ok(PipelineConfig::default());
    };
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).map_err(|err| RuntimeError::Config(err.to_string())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(PipelineConfig::default()),
        Err(err) => Err(RuntimeError::Config(err.to_string())),
    }
}

/// Installs the global `tracing` subscriber, or a no-op one when logging is
/// disabled in configuration — the instrumentation itself stays compiled
/// in either way, only the sink changes.
pub fn install_subscriber(enable_logging: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "self_cli=info,self_pipeline=info".into());

    if enable_logging {
        let _ = tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).try_init();
    } else {
        let _ = tracing_subscriber::registry().with(filter).try_init();
    }
}

/// Runs the pipeline to completion: resolves the firmware profile, takes
/// the service lock, walks `args.source_root`, and returns the terminal
/// run counters.
pub fn run(args: RunArgs) -> Result<RunSummary, RuntimeError> {
    if !args.config.decrypter {
        tracing::info!("decrypter disabled by configuration; nothing to do");
        return Ok(RunSummary::default());
    }

    tracing::info!(config = ?args.config, "effective configuration");

    let env = SystemEnvironment;
    let kmp = SocketKmp::connect(&args.kmp_socket).map_err(|_| RuntimeError::KmpConnect {
        path: args.kmp_socket.clone(),
    })?;

    let profile = firmware_table::resolve_profile(&kmp, args.kernel_base, args.firmware_version)
        .map_err(|_| RuntimeError::UnsupportedFirmware { version: args.firmware_version })?;

    let _lock = ServiceLock::acquire(&kmp, &env, profile.service_lock).map_err(|_| RuntimeError::ServiceLock)?;

    let service = MailboxDecryptService::new(kmp.clone(), profile, env.clone());
    let progress = TracingProgressSink::new();
    let driver = PipelineDriver::new(&service, &env, &progress, &args.config, args.platform_magic);

    let summary = driver.run(&args.source_root, &args.output_root)?;
    tracing::info!(
        processed = summary.processed,
        skipped = summary.skipped,
        failed = summary.failed,
        bytes_decrypted = progress.bytes_decrypted(),
        "run complete"
    );
    Ok(summary)
}
