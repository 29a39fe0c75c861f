//! Timer-driven cycle requests with a re-entrancy guard.
//!
//! The ticker never queues: a firing is dropped when a cycle is still running
//! or a request is already waiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Shared flag marking a decision cycle in progress.
#[derive(Debug, Clone, Default)]
pub struct CycleGuard {
    busy: Arc<AtomicBool>,
}

impl CycleGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a cycle as started. `None` if one is already running.
    #[must_use]
    pub fn try_acquire(&self) -> Option<CycleToken> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleToken {
                busy: Arc::clone(&self.busy),
            })
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held for the duration of one cycle; releases the guard on drop.
#[derive(Debug)]
pub struct CycleToken {
    busy: Arc<AtomicBool>,
}

impl Drop for CycleToken {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Spawns the cycle ticker. The returned receiver has capacity one.
#[must_use]
pub fn spawn_ticker(period: Duration, guard: CycleGuard) -> (JoinHandle<()>, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    let handle = tokio::spawn(async move {
        // First request one full period after start.
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if guard.is_busy() {
                tracing::debug!("Previous cycle still running, dropping tick");
                continue;
            }
            match tx.try_send(()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(())) => {
                    tracing::debug!("Cycle request already pending, dropping tick");
                }
                Err(mpsc::error::TrySendError::Closed(())) => break,
            }
        }
    });
    (handle, rx)
}
