//! Engine facade: start, await, and cancel pipeline runs.
//!
//! Owns the orchestrator context and a registry of in-flight runs. Each
//! accepted command spawns one pipeline workflow; cancellation and
//! force-quit act on the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::{BroadcastBus, EventBus, EventEnvelope};
use crate::config::EngineConfig;
use crate::container::ContainerService;
use crate::identity::pipeline_identity_hash;
use crate::repo::RepositoryService;
use crate::runtime::CancelToken;
use crate::storage::DataService;
use crate::transcript::AdapterRegistry;
use crate::workflows::{
    run_pipeline, OrchestratorContext, PipelineOutcome, StartPipelineCommand, WorkflowError,
};
use crate::model::Project;

/// Result of submitting a start command.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    /// The run id (caller-supplied or generated).
    pub run_id: String,
    /// True when an identical run already existed; nothing was started.
    pub already_exists: bool,
}

struct RunHandle {
    cancel: CancelToken,
    join: JoinHandle<Result<PipelineOutcome, WorkflowError>>,
}

/// The pipeline engine.
pub struct PipelineEngine {
    octx: OrchestratorContext,
    bus: BroadcastBus,
    runs: Mutex<HashMap<String, RunHandle>>,
    root_cancel: CancelToken,
}

impl PipelineEngine {
    /// Builds an engine from its services.
    pub fn new(
        repo: Arc<dyn RepositoryService>,
        containers: Arc<dyn ContainerService>,
        data: Arc<dyn DataService>,
        adapters: Arc<AdapterRegistry>,
        config: EngineConfig,
    ) -> Self {
        let bus = BroadcastBus::new();
        let bus_dyn: Arc<dyn EventBus> = Arc::new(bus.clone());
        let octx = OrchestratorContext::new(repo, containers, data, bus_dyn, adapters, config);
        Self {
            octx,
            bus,
            runs: Mutex::new(HashMap::new()),
            root_cancel: CancelToken::new(),
        }
    }

    /// The orchestrator context (services and queue).
    pub fn context(&self) -> &OrchestratorContext {
        &self.octx
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EventEnvelope> {
        self.bus.subscribe()
    }

    /// Registers (or updates) a project.
    pub async fn register_project(&self, project: &Project) -> Result<(), WorkflowError> {
        self.octx
            .data
            .upsert_project(project)
            .await
            .map_err(|e| WorkflowError::SetupFailed(e.to_string()))
    }

    /// Submits a pipeline. Returns immediately with the run id; use
    /// [`PipelineEngine::wait`] for the outcome.
    ///
    /// Re-submitting an identical pipeline with an existing run id is a
    /// replay: nothing is provisioned and `already_exists` is true.
    /// The same id with a different identity hash is rejected.
    pub async fn start_pipeline(
        &self,
        mut cmd: StartPipelineCommand,
    ) -> Result<StartOutcome, WorkflowError> {
        if let Some(run_id) = cmd.run_id.clone() {
            if let Some(existing) = self
                .octx
                .data
                .get_pipeline_run(&run_id)
                .await
                .map_err(|e| WorkflowError::SetupFailed(e.to_string()))?
            {
                let base_commit = match &cmd.base_commit {
                    Some(commit) => commit.clone(),
                    None => {
                        let project = self
                            .octx
                            .data
                            .get_project(&cmd.project_id)
                            .await
                            .map_err(|e| WorkflowError::SetupFailed(e.to_string()))?
                            .ok_or_else(|| {
                                WorkflowError::ProjectNotFound(cmd.project_id.clone())
                            })?;
                        self.octx
                            .repo
                            .current_commit(&project.repository_path)
                            .await
                            .map_err(|e| WorkflowError::SetupFailed(e.to_string()))?
                    }
                };
                let identity_hash = pipeline_identity_hash(
                    &cmd.pipeline_id,
                    &cmd.steps,
                    &cmd.prompt_prefix,
                    &cmd.prompt_suffix,
                    &base_commit,
                );
                if existing.identity_hash != identity_hash {
                    return Err(WorkflowError::IdentityMismatch { run_id });
                }
                info!(run_id = %run_id, "run already exists; replaying");
                return Ok(StartOutcome {
                    run_id,
                    already_exists: true,
                });
            }
        }

        let run_id = cmd
            .run_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();

        let cancel = self.root_cancel.child();
        let octx = self.octx.clone();
        let workflow_cancel = cancel.clone();
        let join = tokio::spawn(async move { run_pipeline(octx, workflow_cancel, cmd).await });

        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id.clone(), RunHandle { cancel, join });

        info!(run_id = %run_id, "pipeline started");
        Ok(StartOutcome {
            run_id,
            already_exists: false,
        })
    }

    /// Awaits a started run's outcome. A run can be waited on once.
    pub async fn wait(&self, run_id: &str) -> Result<PipelineOutcome, WorkflowError> {
        let handle = self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id)
            .ok_or_else(|| WorkflowError::RunNotFound(run_id.to_string()))?;

        match handle.join.await {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_cancelled() => Err(WorkflowError::Cancelled),
            Err(join_err) => Err(WorkflowError::SetupFailed(format!(
                "pipeline workflow panicked: {}",
                join_err
            ))),
        }
    }

    /// Requests graceful cancellation of a run: the current step's agent
    /// process is killed, compensations run under a disconnected context,
    /// and the run is marked Failed with "Cancelled by user".
    pub fn cancel(&self, run_id: &str, reason: Option<&str>) -> bool {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        match runs.get(run_id) {
            Some(handle) => {
                info!(run_id, reason = reason.unwrap_or("-"), "cancelling run");
                handle.cancel.cancel();
                true
            }
            None => {
                warn!(run_id, "cancel requested for unknown run");
                false
            }
        }
    }

    /// Force-quit: aborts the workflow immediately, skipping
    /// compensations. For the second Ctrl-C.
    pub fn force_quit(&self, run_id: &str) -> bool {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        match runs.get(run_id) {
            Some(handle) => {
                warn!(run_id, "force-quitting run without compensation");
                handle.join.abort();
                true
            }
            None => false,
        }
    }

    /// Ids of runs currently registered (started and not yet waited on).
    pub fn active_runs(&self) -> Vec<String> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}
