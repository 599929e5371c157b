//! Deferred task handles
//!
//! A scoped replacement for "run this after 500ms" callbacks: the task is
//! cancelled when the handle is dropped or `cancel` is called, so teardown
//! never leaves stray timers behind.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A future scheduled to run after a delay, cancelled on drop.
#[derive(Debug)]
pub struct Deferred {
    handle: JoinHandle<()>,
}

impl Deferred {
    pub fn spawn<F>(delay: Duration, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        Self { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
