//! Delayed task execution for entry cleanup
//!
//! The cache only needs "run this after a delay, unless cancelled first".
//! [`DelayedExecutor`] is that seam; [`TokioExecutor`] drives it with the
//! tokio timer.

use crate::error::Result;
use std::fmt;
use std::time::Duration;
use tokio::runtime::Handle;

/// Work handed to an executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs a task once after a delay.
///
/// Implementations must not run `task` inline inside `schedule`; the cache
/// calls `schedule` while holding its table lock.
pub trait DelayedExecutor: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledTask;
}

/// Owned, single-use handle to a scheduled task.
///
/// Consuming it with [`cancel`](Self::cancel) stops the task if it has not
/// run yet. Dropping it without calling [`fired`](Self::fired) cancels as
/// well, so a scheduled task is never orphaned.
pub struct ScheduledTask {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl ScheduledTask {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Prevent the task from running. No-op if it already ran.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Mark the task as having run; releases the handle without cancelling.
    pub fn fired(mut self) {
        self.cancel = None;
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// Executor backed by a tokio runtime: each task is a spawned
/// `sleep(delay)` followed by the task body.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    runtime: Handle,
}

impl TokioExecutor {
    /// Bind to the runtime the caller is running on
    pub fn current() -> Result<Self> {
        Ok(Self {
            runtime: Handle::try_current()?,
        })
    }

    pub fn from_handle(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl DelayedExecutor for TokioExecutor {
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledTask {
        let join = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        let abort = join.abort_handle();
        ScheduledTask::new(move || abort.abort())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_task(counter: &Arc<AtomicUsize>) -> Task {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_current_outside_runtime() {
        let result = TokioExecutor::current();
        assert!(matches!(result, Err(crate::CacheError::NoRuntime)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_after_delay() {
        let executor = TokioExecutor::current().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let task = executor.schedule(Duration::from_millis(200), counting_task(&ran));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        // Cancelling after the task ran is a no-op
        task.cancel();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_run() {
        let executor = TokioExecutor::current().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let task = executor.schedule(Duration::from_millis(200), counting_task(&ran));
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.cancel();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let executor = TokioExecutor::current().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        drop(executor.schedule(Duration::from_millis(50), counting_task(&ran)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fired_releases_without_cancel() {
        let executor = TokioExecutor::current().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        executor
            .schedule(Duration::from_millis(50), counting_task(&ran))
            .fired();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
