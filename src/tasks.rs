//! Supervised detached tasks
//!
//! Work that outlives the request that started it (cluster bootstrap) runs
//! here instead of on a bare `tokio::spawn`, so shutdown can stop new work
//! and wait for what is running.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Launches detached tasks that share one cancellation token
#[derive(Clone, Debug, Default)]
pub struct TaskLauncher {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl TaskLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled on shutdown; long-running tasks select on it
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run `task` detached from the caller.
    ///
    /// Returns `false` without running it once shutdown has started.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            debug!(task = name, "Shutting down, task not started");
            return false;
        }
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = task => debug!(task = name, "Task finished"),
                _ = token.cancelled() => debug!(task = name, "Task cancelled"),
            }
        });
        true
    }

    /// Number of tasks still running
    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel running tasks and wait for them to return
    pub async fn shutdown(&self) {
        info!(running = self.tracker.len(), "Stopping background tasks");
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Wait for the currently running tasks without cancelling them
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
