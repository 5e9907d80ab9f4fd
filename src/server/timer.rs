// ABOUTME: Cancellable one-shot millisecond timer with elapsed-time queries
// ABOUTME: Used to auto-advance the queue shortly before a track ends

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Spawned expiry task and the flag that decides fire-vs-cancel exactly once
#[derive(Debug)]
struct Pending {
    task: JoinHandle<()>,
    settled: Arc<AtomicBool>,
}

/// One-shot deferred callback anchored to the instant it was armed
///
/// The callback runs on its own task. Session code hands it a closure that
/// posts an event back into the session's command channel rather than
/// touching session state.
#[derive(Debug, Default)]
pub struct SynchronizedTimer {
    armed_at: Option<Instant>,
    pending: Option<Pending>,
}

impl SynchronizedTimer {
    /// Create an unarmed timer
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer to call `on_expire` after `duration_millis`
    ///
    /// Re-arming cancels any pending callback first. Negative durations fire
    /// immediately.
    pub fn start<F>(&mut self, duration_millis: i64, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.stop();

        let settled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&settled);
        let delay = Duration::from_millis(duration_millis.max(0) as u64);

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.swap(true, Ordering::AcqRel) {
                on_expire();
            }
        });

        self.armed_at = Some(Instant::now());
        self.pending = Some(Pending { task, settled });
    }

    /// Cancel the pending callback
    ///
    /// Returns true only if this call prevented the callback from running;
    /// false if it already fired, was already stopped, or was never armed.
    pub fn stop(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                let cancelled = !pending.settled.swap(true, Ordering::AcqRel);
                pending.task.abort();
                cancelled
            }
            None => false,
        }
    }

    /// Whether a callback is still waiting to fire
    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| !p.settled.load(Ordering::Acquire))
    }

    /// Milliseconds since the timer was armed, plus `offset_millis`
    pub fn elapsed_millis(&self, offset_millis: i64) -> i64 {
        let elapsed = self
            .armed_at
            .map(|at| at.elapsed().as_millis() as i64)
            .unwrap_or(0);
        elapsed + offset_millis
    }
}

impl Drop for SynchronizedTimer {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hit = Arc::clone(&count);
        (count, move || {
            hit.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_duration() {
        let (count, on_expire) = counter();
        let mut timer = SynchronizedTimer::new();
        timer.start(100, on_expire);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(timer.is_pending());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_callback() {
        let (count, on_expire) = counter();
        let mut timer = SynchronizedTimer::new();
        timer.start(100, on_expire);

        assert!(timer.stop());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let mut never_started = SynchronizedTimer::new();
        assert!(!never_started.stop());
        assert!(!never_started.stop());

        let (_count, on_expire) = counter();
        let mut timer = SynchronizedTimer::new();
        timer.start(100, on_expire);
        assert!(timer.stop());
        assert!(!timer.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_after_fire_returns_false() {
        let (count, on_expire) = counter();
        let mut timer = SynchronizedTimer::new();
        timer.start(10, on_expire);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_millis() {
        let mut timer = SynchronizedTimer::new();
        assert_eq!(timer.elapsed_millis(500), 500);

        timer.start(10_000, || {});
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(timer.elapsed_millis(0), 1_200);
        assert_eq!(timer.elapsed_millis(500), 1_700);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_cancels_previous() {
        let (first, first_cb) = counter();
        let (second, second_cb) = counter();
        let mut timer = SynchronizedTimer::new();

        timer.start(100, first_cb);
        timer.start(300, second_cb);
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
