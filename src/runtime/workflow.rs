//! Child workflow handles.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::debug;

use super::cancel::CancelToken;

/// A spawned child workflow.
///
/// The handle embodies a terminate-on-parent-close policy: dropping it
/// aborts the child task. `cancel()` requests graceful cooperative
/// cancellation through the child's token instead.
#[derive(Debug)]
pub struct ChildWorkflow<T> {
    name: String,
    cancel: CancelToken,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> ChildWorkflow<T> {
    /// Spawns a child workflow under the parent's cancellation scope.
    ///
    /// The builder receives the child's own token, which fires when either
    /// the parent is cancelled or `cancel()` is called on this handle.
    pub fn spawn<F, Fut>(name: impl Into<String>, parent: &CancelToken, build: F) -> Self
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let name = name.into();
        let cancel = parent.child();
        let fut = build(cancel.clone());
        debug!(workflow = %name, "spawning child workflow");

        Self {
            name,
            cancel,
            handle: Some(tokio::spawn(fut)),
        }
    }

    /// Requests graceful cancellation of the child.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the child to finish. Returns `None` when the child was
    /// aborted or panicked.
    pub async fn join(mut self) -> Option<T> {
        let handle = self.handle.take()?;
        handle.await.ok()
    }

    /// Workflow name, for logging.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Drop for ChildWorkflow<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Parent close policy: terminate.
            self.cancel.cancel();
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_join_returns_output() {
        let parent = CancelToken::new();
        let child = ChildWorkflow::spawn("adder", &parent, |_cancel| async { 1 + 1 });
        assert_eq!(child.join().await, Some(2));
    }

    #[tokio::test]
    async fn test_drop_terminates_child() {
        let parent = CancelToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);

        let child = ChildWorkflow::spawn("sleeper", &parent, |_cancel| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            flag.store(true, Ordering::SeqCst);
        });
        drop(child);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_reaches_child_token() {
        let parent = CancelToken::new();
        let child = ChildWorkflow::spawn("watcher", &parent, |cancel| async move {
            cancel.cancelled().await;
            "stopped"
        });

        child.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), child.join())
            .await
            .expect("child should stop");
        assert_eq!(result, Some("stopped"));
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_child_token() {
        let parent = CancelToken::new();
        let child = ChildWorkflow::spawn("watcher", &parent, |cancel| async move {
            cancel.cancelled().await;
            "stopped"
        });

        parent.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), child.join())
            .await
            .expect("child should stop");
        assert_eq!(result, Some("stopped"));
    }
}
