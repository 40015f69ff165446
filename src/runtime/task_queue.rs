//! Named task queues and the activity execution wrapper.
//!
//! An activity is a side-effecting closure executed through a queue. The
//! queue bounds concurrency with a semaphore and the wrapper applies the
//! retry policy, the start-to-close timeout, and heartbeat monitoring.
//! Activities must tolerate re-execution: a retried attempt re-runs the
//! closure from scratch.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::cancel::CancelToken;
use super::heartbeat::Heartbeat;
use super::retry::RetryPolicy;

/// Errors surfaced by activity execution.
#[derive(Debug, Error)]
pub enum ActivityError {
    /// The attempt exceeded its start-to-close timeout.
    #[error("activity timed out after {0:?}")]
    Timeout(Duration),

    /// No heartbeat was recorded within the heartbeat timeout.
    #[error("activity heartbeat lost after {0:?}")]
    HeartbeatLost(Duration),

    /// The workflow context was cancelled.
    #[error("activity cancelled")]
    Cancelled,

    /// The attempt failed; retried per policy.
    #[error("{0}")]
    Failed(String),

    /// The attempt failed in a way retrying cannot fix.
    #[error("{0}")]
    NonRetryable(String),
}

impl ActivityError {
    /// Wraps any error as a retryable failure.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        ActivityError::Failed(err.to_string())
    }

    /// Wraps any error as a non-retryable failure.
    pub fn non_retryable(err: impl std::fmt::Display) -> Self {
        ActivityError::NonRetryable(err.to_string())
    }
}

/// Execution options for one activity.
#[derive(Debug, Clone)]
pub struct ActivityOptions {
    /// Maximum duration of a single attempt.
    pub start_to_close: Duration,
    /// Maximum gap between heartbeats before the attempt is failed.
    pub heartbeat_timeout: Option<Duration>,
    /// Retry policy across attempts.
    pub retry: RetryPolicy,
}

impl ActivityOptions {
    /// Options with the given start-to-close timeout and default retries.
    pub fn new(start_to_close: Duration) -> Self {
        Self {
            start_to_close,
            heartbeat_timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Enables heartbeat monitoring. The timeout is clamped to one sixth
    /// of the start-to-close timeout.
    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout.min(self.start_to_close / 6));
        self
    }

    /// Overrides the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Single-attempt options used for compensations.
    pub fn compensation(start_to_close: Duration) -> Self {
        Self::new(start_to_close).with_retry(RetryPolicy::no_retries())
    }
}

/// Per-attempt context handed to the activity closure.
pub struct ActivityContext {
    /// Cancellation token scoped to this attempt.
    pub cancel: CancelToken,
    /// Heartbeat recorder; required when a heartbeat timeout is set.
    pub heartbeat: Heartbeat,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// A named task queue with a concurrency limit.
///
/// The orchestrator worker serves `orchestrator-queue`; each run's worker
/// serves its run-scoped queue. Activities and child workflows declare
/// their target queue by executing through the matching handle.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    name: Arc<str>,
    permits: Arc<Semaphore>,
}

impl TaskQueue {
    /// Creates a queue served with the given worker concurrency.
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into().into(),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Executes an activity through this queue.
    ///
    /// `make` is invoked once per attempt with a fresh [`ActivityContext`].
    /// Timeouts, lost heartbeats and retryable failures are retried per
    /// the policy; cancellation and non-retryable failures are returned
    /// immediately.
    pub async fn execute<T, F, Fut>(
        &self,
        activity: &str,
        opts: &ActivityOptions,
        cancel: &CancelToken,
        mut make: F,
    ) -> Result<T, ActivityError>
    where
        F: FnMut(ActivityContext) -> Fut,
        Fut: Future<Output = Result<T, ActivityError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(ActivityError::Cancelled);
            }

            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| ActivityError::Cancelled)?;

            let heartbeat = Heartbeat::new();
            let ctx = ActivityContext {
                cancel: cancel.child(),
                heartbeat: heartbeat.clone(),
                attempt,
            };

            debug!(queue = %self.name, activity, attempt, "executing activity");
            let outcome = run_attempt(opts, &heartbeat, make(ctx)).await;
            drop(permit);

            match outcome {
                Ok(value) => return Ok(value),
                Err(err @ ActivityError::Cancelled)
                | Err(err @ ActivityError::NonRetryable(_)) => return Err(err),
                Err(err) => {
                    if !opts.retry.should_retry(attempt) {
                        warn!(
                            queue = %self.name,
                            activity,
                            attempt,
                            error = %err,
                            "activity failed, retries exhausted"
                        );
                        return Err(err);
                    }

                    let delay = opts.retry.delay_for(attempt);
                    warn!(
                        queue = %self.name,
                        activity,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "activity failed, retrying"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(ActivityError::Cancelled),
                    }
                }
            }
        }
    }
}

/// Runs a single attempt under the start-to-close timeout and, when
/// configured, the heartbeat monitor.
async fn run_attempt<T, Fut>(
    opts: &ActivityOptions,
    heartbeat: &Heartbeat,
    fut: Fut,
) -> Result<T, ActivityError>
where
    Fut: Future<Output = Result<T, ActivityError>>,
{
    let attempt = async {
        match tokio::time::timeout(opts.start_to_close, fut).await {
            Ok(result) => result,
            Err(_) => Err(ActivityError::Timeout(opts.start_to_close)),
        }
    };

    match opts.heartbeat_timeout {
        None => attempt.await,
        Some(hb_timeout) => {
            tokio::select! {
                result = attempt => result,
                _ = heartbeat_monitor(heartbeat, hb_timeout) => {
                    Err(ActivityError::HeartbeatLost(hb_timeout))
                }
            }
        }
    }
}

/// Resolves once the gap since the last heartbeat exceeds `timeout`.
async fn heartbeat_monitor(heartbeat: &Heartbeat, timeout: Duration) {
    loop {
        let since = heartbeat.last_beat().elapsed();
        if since >= timeout {
            return;
        }
        tokio::time::sleep(timeout - since + Duration::from_millis(10)).await;
    }
}
