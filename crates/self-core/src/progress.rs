//! Progress and notification reporting.
//!
//! The pipeline core never synchronizes with the progress/notification
//! path; it only reports through this capability and moves on, matching the
//! "one auxiliary parallel worker exists outside the core ... the core
//! never synchronizes with it except through atomically-updated counters"
//! scheduling rule. A sink is injected the same way the decrypt service and
//! kernel memory primitive are, so tests can assert on emitted events
//! without standing up a real notification daemon.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A single progress/notification event the pipeline emits.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A file's decrypt/patch/re-wrap sequence has begun.
    FileStarted {
        /// Path of the file being processed.
        path: PathBuf,
    },
    /// `delta` plaintext bytes were produced by the Block Decryptor.
    BytesDecrypted {
        /// Path of the file being processed.
        path: PathBuf,
        /// Bytes decrypted since the last event.
        delta: u64,
    },
    /// A file completed successfully.
    FileFinished {
        /// Path of the file that finished.
        path: PathBuf,
    },
    /// A file was skipped (not a SELF container).
    FileSkipped {
        /// Path of the file that was skipped.
        path: PathBuf,
    },
    /// A file failed and its partial output (if any) was unlinked.
    FileFailed {
        /// Path of the file that failed.
        path: PathBuf,
        /// Human-readable error summary, for the log/notification line.
        reason: String,
    },
}

/// Best-effort, non-fatal progress and notification sink.
///
/// Implementations must never block the pipeline on slow I/O; a production
/// sink typically hands events off to a background thread or simply logs
/// them inline via `tracing`, which is itself buffered.
pub trait ProgressSink: Clone + Send + Sync + 'static {
    /// Reports an event. Must not fail: sinks that can fail (e.g. a
    /// notification daemon that is unreachable) swallow the error
    /// internally and log it instead.
    fn report(&self, event: ProgressEvent);
}

/// Production [`ProgressSink`] that logs via `tracing` and accumulates a
/// running byte counter a UI or notification daemon can poll.
#[derive(Debug, Clone, Default)]
pub struct TracingProgressSink {
    bytes_decrypted: Arc<AtomicU64>,
}

impl TracingProgressSink {
    /// Creates a sink with its byte counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes decrypted across all files so far.
    #[must_use]
    pub fn bytes_decrypted(&self) -> u64 {
        self.bytes_decrypted.load(Ordering::Relaxed)
    }
}

impl ProgressSink for TracingProgressSink {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::FileStarted { path } => {
                tracing::info!(file = %path.display(), "decrypting");
            },
            ProgressEvent::BytesDecrypted { path, delta } => {
                self.bytes_decrypted.fetch_add(delta, Ordering::Relaxed);
                tracing::debug!(file = %path.display(), delta, "bytes decrypted");
            },
            ProgressEvent::FileFinished { path } => {
                tracing::info!(file = %path.display(), "finished");
            },
            ProgressEvent::FileSkipped { path } => {
                tracing::info!(file = %path.display(), "not a SELF container, skipping");
            },
            ProgressEvent::FileFailed { path, reason } => {
                tracing::warn!(file = %path.display(), reason, "failed");
            },
        }
    }
}

/// [`ProgressSink`] that records every event for assertions in tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingProgressSink {
    events: Arc<std::sync::Mutex<Vec<ProgressEvent>>>,
}

impl RecordingProgressSink {
    /// Creates an empty recording sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots all events reported so far, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned, which only happens if a
    /// prior `report` call panicked mid-lock — acceptable for test code.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().expect("progress sink mutex poisoned").clone()
    }
}

impl ProgressSink for RecordingProgressSink {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().expect("progress sink mutex poisoned").push(event);
    }
}
