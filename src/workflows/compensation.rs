//! Saga-style compensation stack.
//!
//! Workflows register rollback actions as they acquire resources and run
//! them in LIFO order on failure. Compensations execute under a
//! disconnected context (workflow cancellation must not cancel cleanup),
//! get exactly one attempt each, and are idempotent at the activity
//! layer. Failures are logged and the loop continues.

use std::future::Future;
use std::pin::Pin;

use tracing::{info, warn};

type CompensationFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type CompensationFn = Box<dyn FnOnce() -> CompensationFuture + Send>;

struct Compensation {
    name: String,
    action: CompensationFn,
}

/// LIFO stack of best-effort rollback actions.
#[derive(Default)]
pub struct CompensationStack {
    items: Vec<Compensation>,
}

impl CompensationStack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a compensation. The closure is invoked at most once.
    pub fn push<F, Fut>(&mut self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.items.push(Compensation {
            name: name.into(),
            action: Box::new(move || Box::pin(action())),
        });
    }

    /// Number of registered compensations.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when no compensations are registered.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drops all registered compensations without running them (the happy
    /// path: resources are owned by the completed run now).
    pub fn dismiss(&mut self) {
        self.items.clear();
    }

    /// Runs all compensations in LIFO order. Failures never propagate.
    pub async fn run_all(&mut self) {
        while let Some(compensation) = self.items.pop() {
            info!(compensation = %compensation.name, "running compensation");
            match (compensation.action)().await {
                Ok(()) => {}
                Err(err) => {
                    warn!(
                        compensation = %compensation.name,
                        error = %err,
                        "compensation failed; continuing"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_runs_in_lifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CompensationStack::new();

        for i in 0..3 {
            let order = Arc::clone(&order);
            stack.push(format!("comp-{}", i), move || async move {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }

        stack.run_all().await;
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_the_loop() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CompensationStack::new();

        let tracker = Arc::clone(&ran);
        stack.push("first", move || async move {
            tracker.lock().unwrap().push("first");
            Ok(())
        });
        stack.push("failing", || async { Err("disk on fire".to_string()) });
        let tracker = Arc::clone(&ran);
        stack.push("last", move || async move {
            tracker.lock().unwrap().push("last");
            Ok(())
        });

        stack.run_all().await;
        assert_eq!(*ran.lock().unwrap(), vec!["last", "first"]);
    }

    #[tokio::test]
    async fn test_dismiss_skips_everything() {
        let ran = Arc::new(Mutex::new(false));
        let mut stack = CompensationStack::new();
        let tracker = Arc::clone(&ran);
        stack.push("never", move || async move {
            *tracker.lock().unwrap() = true;
            Ok(())
        });

        stack.dismiss();
        stack.run_all().await;
        assert!(!*ran.lock().unwrap());
        assert_eq!(stack.len(), 0);
    }
}
