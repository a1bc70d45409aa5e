//! Graceful shutdown: one process-wide stop flag plus stop-aware sleeping.
//!
//! The watcher loop and the background tasks all pace themselves with
//! [`sleep_unless_stopped`] so a Ctrl+C never waits out a full poll or
//! refresh interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::sleep;
use tracing::info;

/// Sleep for `duration`, waking early when the flag drops.
/// Returns whether the process is still running.
pub async fn sleep_unless_stopped(flag: &Arc<AtomicBool>, duration: Duration) -> bool {
    let check_interval = Duration::from_millis(50);
    let mut elapsed = Duration::ZERO;

    while elapsed < duration {
        if !flag.load(Ordering::Acquire) {
            return false;
        }
        sleep(check_interval.min(duration - elapsed)).await;
        elapsed += check_interval;
    }
    flag.load(Ordering::Acquire)
}

/// Owns the stop flag and the Ctrl+C handler.
pub struct ShutdownManager {
    flag: Arc<AtomicBool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Spawn a Ctrl+C signal handler that triggers shutdown
    pub fn spawn_signal_handler(&self) {
        let flag = Arc::clone(&self.flag);
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal (Ctrl+C)");
                info!("Shutting down gracefully...");
                flag.store(false, Ordering::Release);
            }
        });
    }

    /// Check if the process should continue running
    pub fn is_running(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Get a clone of the shutdown flag for passing to async tasks
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
