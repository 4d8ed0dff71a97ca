//! Tracker for in-flight tear-down work.
//!
//! Actors register their asynchronous tear-down (final snapshot, producer
//! drain, consumer close) here so that process shutdown can wait for all of
//! it before closing the broker client and the listener. Failures are
//! logged, never propagated.

use std::future::Future;

use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Default)]
pub struct CleanupTracker {
    tracker: TaskTracker,
}

impl CleanupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task the shutdown path must wait for. Tasks log their own
    /// failures; nothing propagates out of the tracker.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Stop accepting tasks and wait for everything registered so far.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_waits_for_tasks() {
        let tracker = CleanupTracker::new();
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..4 {
            let counter = counter.clone();
            tracker.spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tracker.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_shutdown_idempotent_when_empty() {
        let tracker = CleanupTracker::new();
        tracker.shutdown().await;
        assert!(tracker.is_empty());
        assert_eq!(tracker.len(), 0);
    }
}
