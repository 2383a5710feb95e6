//! Single-slot cancelable timer.
//!
//! A [`TimerSlot`] holds at most one pending delayed task. Scheduling cancels
//! whatever was pending; a task that has already fired runs to completion even
//! if the slot is cancelled or rescheduled from inside it.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Slot {
    generation: u64,
    pending: Option<CancellationToken>,
}

#[derive(Clone, Default)]
pub struct TimerSlot {
    slot: Arc<Mutex<Slot>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any pending timer, then run `task` after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let generation = {
            let mut slot = self.lock();
            if let Some(previous) = slot.pending.replace(token.clone()) {
                previous.cancel();
            }
            slot.generation += 1;
            slot.generation
        };

        let shared = self.slot.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            {
                let mut slot = shared.lock().unwrap_or_else(|e| e.into_inner());
                // A newer timer may already own the slot.
                if slot.generation == generation {
                    slot.pending = None;
                }
            }
            task.await;
        });
    }

    /// Cancel the pending timer, if any.
    pub fn cancel(&self) {
        if let Some(token) = self.lock().pending.take() {
            token.cancel();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}
