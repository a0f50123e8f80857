//! Delayed, cancellable work on the tokio runtime.

use std::future::Future;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::Instant;

// Wall-clock re-check interval for suspend-aware tasks.
const WALL_CLOCK_POLL: Duration = Duration::from_secs(1);

/// A cancellable unit of work that runs after a delay.
///
/// Dropping the handle cancels the task unless it was detached.
#[derive(Debug)]
pub struct DeferredTask {
    handle: Option<JoinHandle<()>>,
}

impl DeferredTask {
    pub fn after<F>(delay: Duration, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Like [`DeferredTask::after`], but also fires once the wall clock has
    /// passed the deadline. The monotonic clock may stand still while the
    /// process is suspended; the wall clock does not.
    pub fn after_wall_clock<F>(delay: Duration, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let wall_deadline = SystemTime::now() + delay;
        let handle = tokio::spawn(async move {
            loop {
                let now = Instant::now();
                if now >= deadline || SystemTime::now() >= wall_deadline {
                    break;
                }
                tokio::time::sleep_until(deadline.min(now + WALL_CLOCK_POLL)).await;
            }
            task.await;
        });
        Self {
            handle: Some(handle),
        }
    }

    pub fn cancel(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Release the handle without cancelling. Used by a task that tears
    /// down its own owner.
    pub fn detach(mut self) {
        self.handle.take();
    }
}

impl Drop for DeferredTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
