//! Timer (C10): a cancellable one-shot delay, grounded in the teacher's `spawn_heartbeat_task`
//! use of `tokio::time::interval`/`sleep`, generalised to a handle whose cancellation is
//! explicit rather than implied by a shared shutdown flag.

use tokio::sync::oneshot;
use tokio::time::Duration;

/// A scheduled callback; dropping or cancelling the handle stops it from firing.
pub struct Timer {
    cancel: Option<oneshot::Sender<()>>,
}

impl Timer {
    /// Spawns a task that, after `delay`, invokes `on_fire` — unless cancelled first. `on_fire`
    /// runs on the spawned task, not the caller's: it must only enqueue work (same contract as
    /// `coordination`'s watcher callbacks).
    pub fn schedule<F>(delay: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => on_fire(),
                _ = rx => {}
            }
        });
        Self { cancel: Some(tx) }
    }

    /// Cancels the timer. Idempotent; a timer that already fired is simply a no-op to cancel.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let _timer = Timer::schedule(Duration::from_millis(5), move || {
            fired2.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_prevents_fire() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let mut timer = Timer::schedule(Duration::from_millis(20), move || {
            fired2.store(true, Ordering::SeqCst);
        });
        timer.cancel();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
