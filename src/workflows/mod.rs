//! The pipeline execution workflows.
//!
//! Four levels form the workflow tree of a run:
//!
//! ```text
//! PipelineWorkflow
//! ├── SetupWorkflow            (orchestrator queue)
//! ├── ObservabilityWorkflow    (run-scoped queue, child, terminate-on-close)
//! │   └── transcript watcher   (run-scoped activity)
//! └── ProcessingStepWorkflow × N (run-scoped queue, children)
//! ```
//!
//! All state that must survive crashes goes through the data service;
//! everything that touches shared infrastructure runs as an activity on
//! the orchestrator queue.

mod compensation;
mod fork;
mod observability;
mod pipeline;
mod setup;
mod step;

pub use compensation::CompensationStack;
pub use fork::{auto_fork, commit_after_step, resolve_fork, ForkDirective, ForkPlan};
pub use observability::{
    run_observability, ObservabilityHandle, ObservabilityInput, ObservabilityOutput,
};
pub use pipeline::{run_pipeline, PipelineOutcome, StartPipelineCommand};
pub use setup::{run_setup, SetupInput, SetupOutput};
pub use step::{run_processing_step, StepInput};

use std::sync::Arc;

use thiserror::Error;

use crate::bus::{BusError, EngineEvent, EventBus, EventEnvelope, PUBLISH_TIMEOUT};
use crate::config::EngineConfig;
use crate::container::ContainerService;
use crate::identity::ORCHESTRATOR_QUEUE;
use crate::repo::RepositoryService;
use crate::runtime::{ActivityError, ActivityOptions, CancelToken, TaskQueue};
use crate::storage::DataService;
use crate::transcript::AdapterRegistry;

/// Errors surfaced by workflow execution.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Activity(#[from] ActivityError),

    #[error("run '{run_id}' exists with a different identity hash; refusing to replay")]
    IdentityMismatch { run_id: String },

    #[error("fork validation failed: {0}")]
    ForkValidation(String),

    #[error("project '{0}' is not registered")]
    ProjectNotFound(String),

    #[error("run '{0}' not found")]
    RunNotFound(String),

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("setup failed: {0}")]
    SetupFailed(String),

    #[error("step '{step_id}' failed: {reason}")]
    StepFailed { step_id: String, reason: String },
}

/// Shared state of the orchestrator worker: every service the engine
/// consumes, plus the orchestrator task queue they are reached through.
#[derive(Clone)]
pub struct OrchestratorContext {
    pub queue: TaskQueue,
    pub repo: Arc<dyn RepositoryService>,
    pub containers: Arc<dyn ContainerService>,
    pub data: Arc<dyn DataService>,
    pub bus: Arc<dyn EventBus>,
    pub adapters: Arc<AdapterRegistry>,
    pub config: EngineConfig,
}

impl OrchestratorContext {
    /// Builds the context, creating the orchestrator queue from config.
    pub fn new(
        repo: Arc<dyn RepositoryService>,
        containers: Arc<dyn ContainerService>,
        data: Arc<dyn DataService>,
        bus: Arc<dyn EventBus>,
        adapters: Arc<AdapterRegistry>,
        config: EngineConfig,
    ) -> Self {
        let queue = TaskQueue::new(ORCHESTRATOR_QUEUE, config.orchestrator_concurrency);
        Self {
            queue,
            repo,
            containers,
            data,
            bus,
            adapters,
            config,
        }
    }

    /// Publishes an event as an orchestrator-queue activity. Failures are
    /// retried by the activity layer; exhausted retries drop the event
    /// (downstream deduplicates, loss is acceptable).
    pub async fn publish_event(&self, cancel: &CancelToken, event: EngineEvent) {
        let bus = Arc::clone(&self.bus);
        let kind = event.kind();
        let result = self
            .queue
            .execute(
                "PublishEvent",
                &ActivityOptions::new(PUBLISH_TIMEOUT),
                cancel,
                |_ctx| {
                    let bus = Arc::clone(&bus);
                    let envelope = EventEnvelope::new(event.clone());
                    async move {
                        match tokio::time::timeout(PUBLISH_TIMEOUT, bus.publish(envelope)).await {
                            Ok(Ok(())) => Ok(()),
                            Ok(Err(err)) => Err(ActivityError::failed(err)),
                            Err(_) => {
                                Err(ActivityError::failed(BusError::Timeout(PUBLISH_TIMEOUT)))
                            }
                        }
                    }
                },
            )
            .await;

        if let Err(err) = result {
            tracing::warn!(kind, error = %err, "event dropped after publish retries");
        }
    }
}

/// Per-run worker state: the run-scoped task queue and how to reach the
/// agent binary from this process.
#[derive(Clone)]
pub struct RunContext {
    /// The run-scoped queue served by the worker in the run's container.
    pub queue: TaskQueue,
    /// Wrapper prepended to agent argv (empty when the worker shares the
    /// agent's filesystem view).
    pub command_prefix: Vec<String>,
}

impl RunContext {
    /// Creates the run worker context for a queue name.
    pub fn new(queue_name: &str, concurrency: usize) -> Self {
        Self {
            queue: TaskQueue::new(queue_name, concurrency),
            command_prefix: Vec::new(),
        }
    }

    /// Sets the command prefix.
    pub fn with_command_prefix(mut self, prefix: Vec<String>) -> Self {
        self.command_prefix = prefix;
        self
    }
}
