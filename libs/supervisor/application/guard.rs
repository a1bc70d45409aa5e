//! Guard against naked positions: a named timer per entry order.
//!
//! When an entry fills, a timer is armed before the SL placement attempt.
//! A successful placement cancels it; otherwise the timer runs the supplied
//! emergency action exactly once. `start` happens-before any possible
//! timeout; a `notify_sl_placed` observed before the deadline guarantees
//! the action never runs.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

struct TimerSlot {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    timers: HashMap<String, TimerSlot>,
    next_generation: u64,
}

#[derive(Clone, Default)]
pub struct SlPlacementGuard {
    registry: Arc<Mutex<Registry>>,
}

impl SlPlacementGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer for `entry_id`. A previous timer under the
    /// same key is discarded; only the newest one can fire.
    pub fn start<F>(&self, entry_id: &str, timeout: Duration, on_timeout: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        let key = entry_id.to_string();

        let mut guard = registry.lock();
        let generation = guard.next_generation;
        guard.next_generation += 1;

        let task_registry = Arc::clone(&registry);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            // Deregister first: once we are out of the map, a late
            // notify_sl_placed can no longer abort the action mid-flight.
            {
                let mut guard = task_registry.lock();
                match guard.timers.get(&task_key) {
                    Some(slot) if slot.generation == generation => {
                        guard.timers.remove(&task_key);
                    }
                    // A newer timer replaced this one while we slept
                    _ => return,
                }
            }

            error!(
                entry_order_id = %task_key,
                timeout_sec = timeout.as_secs(),
                "SL placement timed out, running emergency action"
            );
            on_timeout.await;
        });

        if let Some(previous) = guard.timers.insert(key.clone(), TimerSlot { generation, handle }) {
            previous.handle.abort();
        }
        drop(guard);

        debug!(entry_order_id = %key, timeout_sec = timeout.as_secs(), "sl guard started");
    }

    /// The SL is live; disarm the timer. Idempotent.
    pub fn notify_sl_placed(&self, entry_id: &str) {
        let slot = self.registry.lock().timers.remove(entry_id);
        if let Some(slot) = slot {
            slot.handle.abort();
            info!(entry_order_id = entry_id, "sl guard disarmed");
        }
    }

    /// Disarm everything. Used on shutdown.
    pub fn cancel_all(&self) {
        let mut guard = self.registry.lock();
        for (_, slot) in guard.timers.drain() {
            slot.handle.abort();
        }
        debug!("sl guard cleared");
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_future(counter: Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn fires_once_after_timeout() {
        let guard = SlPlacementGuard::new();
        let fired = Arc::new(AtomicUsize::new(0));

        guard.start("E1", Duration::from_millis(20), counter_future(fired.clone()));
        assert_eq!(guard.active_count(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(guard.active_count(), 0);
    }

    #[tokio::test]
    async fn notify_before_timeout_prevents_firing() {
        let guard = SlPlacementGuard::new();
        let fired = Arc::new(AtomicUsize::new(0));

        guard.start("E1", Duration::from_millis(50), counter_future(fired.clone()));
        guard.notify_sl_placed("E1");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(guard.active_count(), 0);
    }

    #[tokio::test]
    async fn notify_is_idempotent() {
        let guard = SlPlacementGuard::new();
        guard.notify_sl_placed("never-started");
        guard.start("E1", Duration::from_millis(50), async {});
        guard.notify_sl_placed("E1");
        guard.notify_sl_placed("E1");
    }

    #[tokio::test]
    async fn restart_discards_the_older_timer() {
        let guard = SlPlacementGuard::new();
        let fired = Arc::new(AtomicUsize::new(0));

        guard.start("E1", Duration::from_millis(20), counter_future(fired.clone()));
        guard.start("E1", Duration::from_millis(60), counter_future(fired.clone()));
        assert_eq!(guard.active_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        // only the second timer fired
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_all_disarms_every_timer() {
        let guard = SlPlacementGuard::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for id in ["E1", "E2", "E3"] {
            guard.start(id, Duration::from_millis(30), counter_future(fired.clone()));
        }
        guard.cancel_all();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(guard.active_count(), 0);
    }
}
