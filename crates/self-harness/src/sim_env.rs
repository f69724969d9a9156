//! Deterministic virtual-time [`Environment`].
//!
//! Every suspension point the pipeline has (mailbox polling, retry backoff,
//! the 256-write service-lock dance) goes through `Environment::sleep`, so a
//! simulation that makes `sleep` advance a virtual clock instead of blocking
//! the thread turns a multi-second real run into an instant one while
//! leaving every timing-dependent code path exercised exactly as written.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use self_core::Environment;

/// A point in virtual time: nanoseconds elapsed since the environment was
/// created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualInstant(u64);

impl std::ops::Sub for VirtualInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(rhs.0))
    }
}

/// [`Environment`] whose `sleep` advances a shared virtual clock rather than
/// blocking, so a simulated run completes in real time proportional to the
/// number of sleeps rather than their requested durations.
#[derive(Debug, Clone, Default)]
pub struct SimEnvironment {
    nanos: Arc<AtomicU64>,
}

impl SimEnvironment {
    /// Creates a fresh environment with its virtual clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total virtual time elapsed across every `sleep` call so far. Lets a
    /// test assert a retry loop actually backed off the expected amount
    /// without having to wait for it.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Relaxed))
    }
}

impl Environment for SimEnvironment {
    type Instant = VirtualInstant;

    fn now(&self) -> VirtualInstant {
        VirtualInstant(self.nanos.load(Ordering::Relaxed))
    }

    fn sleep(&self, duration: Duration) {
        self.nanos.fetch_add(duration.as_nanos().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
    }
}
