//! Pipeline workflow: the core orchestrator of a run.
//!
//! ```text
//! IdentifyRun → Setup → [StartObservability] → StepLoop → Finalise
//!                   │                             │
//!                   └──────── MarkFailed ←────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::EngineEvent;
use crate::identity::{
    compose_prompt, pipeline_identity_hash, run_task_queue, step_definition_hash,
    substitute_runtime_vars, RuntimeVars,
};
use crate::model::{PipelineRun, RunStatus, StepDefinition, StepResult, StepStatus};
use crate::runtime::{ActivityError, ActivityOptions, CancelToken, ChildWorkflow};

use super::observability::observability_channel;
use super::{
    resolve_fork, run_observability, run_processing_step, run_setup, CompensationStack,
    ForkDirective, ForkPlan, ObservabilityInput, OrchestratorContext, RunContext, SetupInput,
    StepInput, WorkflowError,
};

/// Reason recorded on runs failed by user cancellation.
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

/// Drain window before finalising, letting the watcher forward the last
/// transcript lines.
const FINALISE_DRAIN: Duration = Duration::from_secs(5);
/// Timeout for the short resolve/persist activities in this workflow.
const SHORT_TIMEOUT: Duration = Duration::from_secs(30);

/// A request to start (or replay) a pipeline.
#[derive(Debug, Clone)]
pub struct StartPipelineCommand {
    /// Caller-supplied run id; generated when absent.
    pub run_id: Option<String>,
    pub project_id: String,
    pub pipeline_id: String,
    /// Human-readable run name.
    pub name: String,
    /// Ordered step definitions.
    pub steps: Vec<StepDefinition>,
    pub prompt_prefix: String,
    pub prompt_suffix: String,
    /// Base commit; repository `HEAD` when absent.
    pub base_commit: Option<String>,
    /// Explicit fork parent.
    pub fork_from_run_id: Option<String>,
    /// Last inherited step when forking.
    pub fork_after_step_id: Option<String>,
    /// Disables the auto-fork scan.
    pub no_auto_fork: bool,
}

impl StartPipelineCommand {
    /// Creates a command with the minimum required fields.
    pub fn new(
        project_id: impl Into<String>,
        pipeline_id: impl Into<String>,
        name: impl Into<String>,
        steps: Vec<StepDefinition>,
    ) -> Self {
        Self {
            run_id: None,
            project_id: project_id.into(),
            pipeline_id: pipeline_id.into(),
            name: name.into(),
            steps,
            prompt_prefix: String::new(),
            prompt_suffix: String::new(),
            base_commit: None,
            fork_from_run_id: None,
            fork_after_step_id: None,
            no_auto_fork: false,
        }
    }

    /// Adapter tag of the run, taken from the first agent-bearing step.
    pub fn source(&self) -> String {
        self.steps
            .iter()
            .find_map(|s| s.agent.as_ref().map(|a| a.tool_name.clone()))
            .unwrap_or_else(|| "claude".to_string())
    }
}

/// Final state of a pipeline workflow.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub run_id: String,
    /// True when an identical run already existed and was replayed.
    pub already_exists: bool,
    pub status: RunStatus,
    pub head_commit_sha: Option<String>,
    pub step_results: Vec<StepResult>,
}

/// Runs a pipeline to completion.
pub async fn run_pipeline(
    octx: OrchestratorContext,
    cancel: CancelToken,
    cmd: StartPipelineCommand,
) -> Result<PipelineOutcome, WorkflowError> {
    // --- IdentifyRun -----------------------------------------------------
    let project = octx
        .data
        .get_project(&cmd.project_id)
        .await
        .map_err(|e| WorkflowError::SetupFailed(e.to_string()))?
        .ok_or_else(|| WorkflowError::ProjectNotFound(cmd.project_id.clone()))?;

    let base_commit = match &cmd.base_commit {
        Some(commit) => commit.clone(),
        None => {
            let repo = Arc::clone(&octx.repo);
            let path = project.repository_path.clone();
            octx.queue
                .execute(
                    "ResolveBaseCommit",
                    &ActivityOptions::new(SHORT_TIMEOUT),
                    &cancel,
                    move |_ctx| {
                        let repo = Arc::clone(&repo);
                        let path = path.clone();
                        async move {
                            repo.current_commit(&path).await.map_err(ActivityError::failed)
                        }
                    },
                )
                .await?
        }
    };

    let run_id = cmd
        .run_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let identity_hash = pipeline_identity_hash(
        &cmd.pipeline_id,
        &cmd.steps,
        &cmd.prompt_prefix,
        &cmd.prompt_suffix,
        &base_commit,
    );

    if let Some(existing) = octx
        .data
        .get_pipeline_run(&run_id)
        .await
        .map_err(|e| WorkflowError::SetupFailed(e.to_string()))?
    {
        if existing.identity_hash != identity_hash {
            return Err(WorkflowError::IdentityMismatch { run_id });
        }
        // Replay: the run already happened (or is happening). Return its
        // persisted state without provisioning anything.
        info!(run_id = %run_id, "replaying existing run");
        let step_results = octx
            .data
            .list_step_results(&run_id)
            .await
            .map_err(|e| WorkflowError::SetupFailed(e.to_string()))?;
        return Ok(PipelineOutcome {
            run_id,
            already_exists: true,
            status: existing.status,
            head_commit_sha: existing.head_commit_sha,
            step_results,
        });
    }

    // --- Fork resolution -------------------------------------------------
    let fork_plan: Option<ForkPlan> = {
        let directive = if let Some(parent_run_id) = &cmd.fork_from_run_id {
            let fork_after_step_id = cmd.fork_after_step_id.clone().ok_or_else(|| {
                WorkflowError::ForkValidation(
                    "fork_from_run_id requires fork_after_step_id".to_string(),
                )
            })?;
            Some(ForkDirective {
                parent_run_id: parent_run_id.clone(),
                fork_after_step_id,
            })
        } else if !cmd.no_auto_fork {
            super::auto_fork(
                &octx.data,
                &cmd.project_id,
                &cmd.pipeline_id,
                &cmd.steps,
                &cmd.prompt_prefix,
                &cmd.prompt_suffix,
                &base_commit,
            )
            .await?
        } else {
            None
        };

        match directive {
            Some(directive) => Some(
                resolve_fork(
                    octx.data.as_ref(),
                    &directive,
                    &cmd.steps,
                    &cmd.prompt_prefix,
                    &cmd.prompt_suffix,
                )
                .await?,
            ),
            None => None,
        }
    };

    // --- Setup -----------------------------------------------------------
    let mut run = PipelineRun::new(
        run_id.clone(),
        cmd.pipeline_id.clone(),
        cmd.project_id.clone(),
        cmd.name.clone(),
    );
    run.base_commit_sha = Some(base_commit.clone());
    run.prompt_prefix = cmd.prompt_prefix.clone();
    run.prompt_suffix = cmd.prompt_suffix.clone();
    run.identity_hash = identity_hash;
    run.workflow_id = Some(format!("pipeline-{}", run_id));
    if let Some(plan) = &fork_plan {
        run.parent_run_id = Some(plan.parent_run_id.clone());
        run.fork_after_step_id = Some(plan.fork_after_step_id.clone());
        run.start_commit_sha = Some(plan.start_commit_sha.clone());
    } else {
        run.start_commit_sha = Some(base_commit.clone());
    }

    let source = cmd.source();
    let run_queue_name = run_task_queue(&cmd.name, &run_id);
    let checkout_commit = fork_plan
        .as_ref()
        .map(|p| p.start_commit_sha.clone())
        .unwrap_or_else(|| base_commit.clone());

    let mut comp = CompensationStack::new();
    let setup_input = SetupInput {
        run: run.clone(),
        repository_path: project.repository_path.clone(),
        checkout_commit,
        branch_name: None,
        source: source.clone(),
        run_queue_name: run_queue_name.clone(),
    };

    let setup = match tokio::time::timeout(
        octx.config.setup_timeout,
        run_setup(&octx, &cancel, &mut comp, setup_input),
    )
    .await
    {
        Ok(Ok(output)) => output,
        Ok(Err(WorkflowError::Activity(ActivityError::Cancelled)))
        | Ok(Err(WorkflowError::Cancelled)) => {
            return cancel_run(&octx, &mut comp, run, &cmd, Vec::new()).await;
        }
        Ok(Err(err)) => {
            error!(run_id = %run_id, error = %err, "setup failed");
            return fail_run(&octx, &mut comp, run, &cmd, err).await;
        }
        Err(_) => {
            let err = WorkflowError::SetupFailed(format!(
                "setup exceeded {:?}",
                octx.config.setup_timeout
            ));
            error!(run_id = %run_id, error = %err, "setup timed out");
            return fail_run(&octx, &mut comp, run, &cmd, err).await;
        }
    };
    run = setup.run.clone();

    octx.publish_event(
        &cancel,
        EngineEvent::PipelineCreated {
            project_id: cmd.project_id.clone(),
            run_id: run_id.clone(),
            name: cmd.name.clone(),
            run: Box::new(run.clone()),
        },
    )
    .await;

    // --- Observability child --------------------------------------------
    let mut rctx = RunContext::new(&run_queue_name, octx.config.run_worker_concurrency);
    if octx.config.exec_in_container {
        rctx = rctx.with_command_prefix(vec![
            "docker".to_string(),
            "exec".to_string(),
            "-w".to_string(),
            octx.config.workspace_path.clone(),
            setup.container_id.clone(),
        ]);
    }

    let (obs_handle, step_changes) = observability_channel();
    let obs_input = ObservabilityInput {
        run_id: run_id.clone(),
        project_id: cmd.project_id.clone(),
        transcript_dir: octx.config.transcript_dir.clone(),
        source: source.clone(),
        poll_interval: octx.config.transcript_poll_interval,
    };
    let observability = ChildWorkflow::spawn("observability", &cancel, {
        let octx = octx.clone();
        let rctx = rctx.clone();
        move |token| run_observability(octx, rctx, token, obs_input, step_changes)
    });

    // --- Step loop -------------------------------------------------------
    let fork_index = fork_plan.as_ref().map(|p| p.fork_after_index);
    let mut previous_commit = setup.start_commit_sha.clone();
    let mut step_results: Vec<StepResult> = Vec::with_capacity(cmd.steps.len());

    for (index, step) in cmd.steps.iter().enumerate() {
        if cancel.is_cancelled() {
            return cancel_run(&octx, &mut comp, run, &cmd, step_results).await;
        }

        // Skip mode: inherit the pre-fork prefix without invoking agents.
        if let (Some(fork_index), Some(plan)) = (fork_index, &fork_plan) {
            if index <= fork_index {
                let skipped = StepResult::skipped_from(&plan.inherited[index], &run_id);
                persist_result(&octx, &cancel, &skipped).await?;
                if let Some(sha) = &skipped.commit_sha {
                    previous_commit = sha.clone();
                }
                info!(run_id = %run_id, step_id = %step.step_id, "step skipped (fork prefix)");
                step_results.push(skipped);
                continue;
            }
        }

        let prompt = build_prompt(&cmd, step, index, &run_id);
        obs_handle.signal_step_change(&step.step_id);

        let step_input = StepInput {
            run_id: run_id.clone(),
            project_id: cmd.project_id.clone(),
            step: step.clone(),
            step_index: index,
            prompt,
            worktree_path: setup.worktree_path.clone(),
            previous_commit: previous_commit.clone(),
            definition_hash: step_definition_hash(step),
            source: source.clone(),
        };

        let child = ChildWorkflow::spawn(format!("step-{}", step.step_id), &cancel, {
            let octx = octx.clone();
            let rctx = rctx.clone();
            move |token| async move {
                run_processing_step(&octx, &rctx, &token, step_input).await
            }
        });

        let step_outcome =
            tokio::time::timeout(octx.config.step_timeout + Duration::from_secs(60), child.join())
                .await;

        let result = match step_outcome {
            Ok(Some(Ok(result))) => result,
            Ok(Some(Err(WorkflowError::Activity(ActivityError::Cancelled))))
            | Ok(Some(Err(WorkflowError::Cancelled))) => {
                return cancel_run(&octx, &mut comp, run, &cmd, step_results).await;
            }
            Ok(Some(Err(err))) => {
                error!(run_id = %run_id, step_id = %step.step_id, error = %err, "step errored");
                return fail_run(&octx, &mut comp, run, &cmd, err).await;
            }
            Ok(None) | Err(_) => {
                let err = WorkflowError::StepFailed {
                    step_id: step.step_id.clone(),
                    reason: "step workflow did not complete".to_string(),
                };
                return fail_run(&octx, &mut comp, run, &cmd, err).await;
            }
        };

        if cancel.is_cancelled() {
            step_results.push(result);
            return cancel_run(&octx, &mut comp, run, &cmd, step_results).await;
        }

        if result.status != StepStatus::Completed {
            let err = WorkflowError::StepFailed {
                step_id: step.step_id.clone(),
                reason: result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "agent failed".to_string()),
            };
            step_results.push(result);
            return fail_run(&octx, &mut comp, run, &cmd, err).await;
        }

        if let Some(sha) = &result.commit_sha {
            previous_commit = sha.clone();
        }
        step_results.push(result);
    }

    // --- Finalise --------------------------------------------------------
    obs_handle.signal_step_change("");
    tokio::time::sleep(FINALISE_DRAIN).await;

    run.mark_completed(previous_commit.clone());
    persist_run(&octx, &cancel, &run).await?;

    octx.publish_event(
        &cancel,
        EngineEvent::PipelineFinished {
            project_id: cmd.project_id.clone(),
            run_id: run_id.clone(),
            name: cmd.name.clone(),
            run: Box::new(run.clone()),
        },
    )
    .await;

    // The run's commits live in the repository; the worker container has
    // nothing left to do. Stop it, keep the worktree for inspection until
    // the run is explicitly deleted.
    stop_container_quietly(&octx, &run).await;
    comp.dismiss();
    drop(observability); // parent close: terminate

    info!(run_id = %run_id, head = %previous_commit, "pipeline completed");
    Ok(PipelineOutcome {
        run_id,
        already_exists: false,
        status: RunStatus::Completed,
        head_commit_sha: Some(previous_commit),
        step_results,
    })
}

/// Composes the effective prompt for one step.
fn build_prompt(
    cmd: &StartPipelineCommand,
    step: &StepDefinition,
    index: usize,
    run_id: &str,
) -> String {
    let template = step
        .agent
        .as_ref()
        .map(|a| a.prompt_template.as_str())
        .unwrap_or("");
    let composed = compose_prompt(&cmd.prompt_prefix, template, &cmd.prompt_suffix);
    let vars = RuntimeVars {
        run_id: run_id.to_string(),
        step_index: index,
        step_id: step.step_id.clone(),
        previous_step_id: if index == 0 {
            String::new()
        } else {
            cmd.steps[index - 1].step_id.clone()
        },
    };
    substitute_runtime_vars(&composed, &vars)
}

async fn persist_result(
    octx: &OrchestratorContext,
    cancel: &CancelToken,
    result: &StepResult,
) -> Result<(), WorkflowError> {
    let data = Arc::clone(&octx.data);
    let result = result.clone();
    octx.queue
        .execute(
            "PersistStepResult",
            &ActivityOptions::new(SHORT_TIMEOUT),
            cancel,
            move |_ctx| {
                let data = Arc::clone(&data);
                let result = result.clone();
                async move {
                    data.update_step_result(&result)
                        .await
                        .map_err(ActivityError::failed)
                }
            },
        )
        .await?;
    Ok(())
}

async fn persist_run(
    octx: &OrchestratorContext,
    cancel: &CancelToken,
    run: &PipelineRun,
) -> Result<(), WorkflowError> {
    let data = Arc::clone(&octx.data);
    let run = run.clone();
    octx.queue
        .execute(
            "PersistRun",
            &ActivityOptions::new(SHORT_TIMEOUT),
            cancel,
            move |_ctx| {
                let data = Arc::clone(&data);
                let run = run.clone();
                async move {
                    // Create first so failures before setup's persist still
                    // leave a retained row, then update with final state.
                    data.create_pipeline_run(&run)
                        .await
                        .map_err(ActivityError::failed)?;
                    data.update_pipeline_run(&run)
                        .await
                        .map_err(ActivityError::failed)
                }
            },
        )
        .await?;
    Ok(())
}

async fn stop_container_quietly(octx: &OrchestratorContext, run: &PipelineRun) {
    if let Some(container_id) = &run.container_id {
        if let Err(err) = octx
            .containers
            .stop(container_id, octx.config.container_stop_timeout)
            .await
        {
            warn!(container_id = %container_id, error = %err, "failed to stop run container");
        }
    }
}

/// Failure path: compensations, run marked Failed, terminal event.
async fn fail_run(
    octx: &OrchestratorContext,
    comp: &mut CompensationStack,
    mut run: PipelineRun,
    cmd: &StartPipelineCommand,
    err: WorkflowError,
) -> Result<PipelineOutcome, WorkflowError> {
    comp.run_all().await;

    run.mark_failed(err.to_string());
    let detached = CancelToken::new();
    if let Err(persist_err) = persist_run(octx, &detached, &run).await {
        error!(run_id = %run.id, error = %persist_err, "failed to persist failed run");
    }

    octx.publish_event(
        &detached,
        EngineEvent::PipelineFailed {
            project_id: cmd.project_id.clone(),
            run_id: run.id.clone(),
            name: cmd.name.clone(),
        },
    )
    .await;

    Err(err)
}

/// Cancellation path: step child is already dead (context cancellation
/// killed the agent subprocess); run compensations under a disconnected
/// context and record the cancellation.
async fn cancel_run(
    octx: &OrchestratorContext,
    comp: &mut CompensationStack,
    mut run: PipelineRun,
    cmd: &StartPipelineCommand,
    _step_results: Vec<StepResult>,
) -> Result<PipelineOutcome, WorkflowError> {
    warn!(run_id = %run.id, "pipeline cancelled by user");
    comp.run_all().await;

    run.mark_failed(CANCELLED_BY_USER);
    let detached = CancelToken::new();
    if let Err(persist_err) = persist_run(octx, &detached, &run).await {
        error!(run_id = %run.id, error = %persist_err, "failed to persist cancelled run");
    }

    octx.publish_event(
        &detached,
        EngineEvent::PipelineFailed {
            project_id: cmd.project_id.clone(),
            run_id: run.id.clone(),
            name: cmd.name.clone(),
        },
    )
    .await;

    Err(WorkflowError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AgentConfig;

    #[test]
    fn test_source_from_first_agent_step() {
        let mut cmd = StartPipelineCommand::new("proj", "pl", "demo", vec![]);
        assert_eq!(cmd.source(), "claude");

        cmd.steps = vec![
            StepDefinition::new("bare", "No agent"),
            StepDefinition::new("ai", "Agent").with_agent(AgentConfig::new("codex", "go")),
        ];
        assert_eq!(cmd.source(), "codex");
    }

    #[test]
    fn test_build_prompt_composition_and_vars() {
        let step = StepDefinition::new("fix", "Fix")
            .with_agent(AgentConfig::new("claude", "fix step {{.StepID}} of {{.RunID}}"));
        let mut cmd = StartPipelineCommand::new("proj", "pl", "demo", vec![step.clone()]);
        cmd.prompt_prefix = "Please: ".to_string();
        cmd.prompt_suffix = " Thanks.".to_string();

        let prompt = build_prompt(&cmd, &step, 0, "run-1");
        assert_eq!(prompt, "Please: fix step fix of run-1 Thanks.");
    }

    #[test]
    fn test_build_prompt_previous_step_id() {
        let steps = vec![
            StepDefinition::new("a", "A").with_agent(AgentConfig::new("claude", "after={{.PreviousStepID}}")),
            StepDefinition::new("b", "B").with_agent(AgentConfig::new("claude", "after={{.PreviousStepID}}")),
        ];
        let cmd = StartPipelineCommand::new("proj", "pl", "demo", steps.clone());

        assert_eq!(build_prompt(&cmd, &steps[0], 0, "r"), "after=");
        assert_eq!(build_prompt(&cmd, &steps[1], 1, "r"), "after=a");
    }
}
