//! Clock & Scheduler.
//!
//! Monotonic time and cancellable one-shot/periodic timers, injected as a
//! dependency into every component that needs to schedule work instead of
//! reaching for a process-wide singleton (per the "no global state" design
//! note). Timer handles wrap a `tokio::task::JoinHandle` and abort on drop
//! or explicit `cancel()`, replacing the reference system's
//! `setTimeout`-based escalation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

/// Source of the current time. Implementations inject a fake clock in tests
/// to make escalation and rate-limit windows deterministic.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> i64;

    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_ms()).unwrap_or_else(Utc::now)
    }
}

/// Wall-clock implementation used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A cancellable timer. Dropping the handle does not cancel the timer (the
/// owner decides lifecycle); call `cancel()` explicitly.
pub struct TimerHandle {
    join: JoinHandle<()>,
}

impl TimerHandle {
    /// Aborts the underlying task. Safe to call more than once.
    pub fn cancel(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Schedules one-shot and periodic work on the tokio runtime. Injected so
/// components never call `tokio::spawn`/`tokio::time::sleep` directly,
/// keeping scheduling policy in one place and swappable in tests.
#[derive(Clone, Default)]
pub struct Scheduler {
    clock: Option<Arc<dyn Clock>>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock: Some(clock) }
    }

    /// Runs `task` once after `delay`. Returns a handle the caller can
    /// `cancel()` before it fires.
    pub fn schedule_once<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        TimerHandle { join }
    }

    /// Runs `make_task()` repeatedly every `period`, starting after one
    /// period has elapsed.
    pub fn schedule_periodic<F, Fut>(&self, period: Duration, mut make_task: F) -> TimerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                make_task().await;
            }
        });
        TimerHandle { join }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn schedule_once_runs_after_delay() {
        let scheduler = Scheduler::default();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let _handle = scheduler.schedule_once(Duration::from_millis(10), async move {
            fired2.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_prevents_fire() {
        let scheduler = Scheduler::default();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let handle = scheduler.schedule_once(Duration::from_millis(50), async move {
            fired2.store(true, Ordering::SeqCst);
        });
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
