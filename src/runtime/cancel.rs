//! Hierarchical cooperative cancellation.

use tokio::sync::watch;

/// A cancellation token.
///
/// Tokens form a tree: cancelling a token cancels everything below it,
/// while a child can be cancelled without touching its parent.
/// `disconnected()` produces a root token that ignores the original tree,
/// used for compensation work that must survive workflow cancellation.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: watch::Sender<bool>,
    parent: Option<Box<CancelToken>>,
}

impl CancelToken {
    /// Creates a fresh root token.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx, parent: None }
    }

    /// Creates a child token: cancelled when either it or any ancestor is
    /// cancelled.
    pub fn child(&self) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Creates a root token unrelated to this one.
    pub fn disconnected(&self) -> Self {
        Self::new()
    }

    /// Requests cancellation of this token and its descendants.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// True when this token or any ancestor has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow() || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Resolves when this token or any ancestor is cancelled.
    pub async fn cancelled(&self) {
        // Walk the ancestry once, then wait for any level to flip.
        let mut receivers = Vec::new();
        let mut current = Some(self);
        while let Some(token) = current {
            if *token.tx.borrow() {
                return;
            }
            receivers.push(token.tx.subscribe());
            current = token.parent.as_deref();
        }

        let waiters = receivers.into_iter().map(|rx| Box::pin(wait_for_true(rx)));
        futures::future::select_all(waiters).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_true(mut rx: watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
    // Sender gone without cancelling: this level can never fire.
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_resolves_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should resolve")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_child() {
        let parent = CancelToken::new();
        let child = parent.child();

        parent.cancel();
        assert!(child.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .expect("child waiter should resolve");
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent_alone() {
        let parent = CancelToken::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_disconnected_ignores_tree() {
        let parent = CancelToken::new();
        let detached = parent.disconnected();

        parent.cancel();
        assert!(!detached.is_cancelled());
    }
}
