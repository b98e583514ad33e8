//! Injectable time source.
//!
//! The scheduler and executor take their monotonic timestamps and sleeps
//! through the [`Clock`] trait so tests can substitute a deterministic
//! implementation. Production code uses [`SystemClock`], which delegates to
//! `std::time::Instant` and `tokio::time::sleep`.

use async_trait::async_trait;
use std::time::{Duration, Instant};

/// Monotonic time source for the engine.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Suspend the current task for `d`.
    async fn sleep(&self, d: Duration);
}

/// Default [`Clock`] backed by the OS monotonic clock and the tokio timer.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}
