//! Processing step workflow: run one agent step and capture its commit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::bus::EngineEvent;
use crate::exec::{local_execute, ExecuteRequest};
use crate::model::{StepDefinition, StepResult, StepStatus};
use crate::repo::DiffSummary;
use crate::runtime::{ActivityError, ActivityOptions, CancelToken, RetryPolicy};
use crate::transcript::preview;

use super::{OrchestratorContext, RunContext, WorkflowError};

/// Timeout for argv rendering and persistence activities.
const SHORT_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for diff and commit activities.
const GIT_TIMEOUT: Duration = Duration::from_secs(120);
/// Heartbeat interval required from the agent execution activity.
const EXEC_HEARTBEAT: Duration = Duration::from_secs(60);
/// Max chars of stderr kept as a failure reason.
const ERROR_PREVIEW: usize = 500;

/// Inputs to a processing step workflow.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub run_id: String,
    pub project_id: String,
    pub step: StepDefinition,
    pub step_index: usize,
    /// Composed prompt with runtime variables already substituted.
    pub prompt: String,
    /// Host path of the run's worktree.
    pub worktree_path: PathBuf,
    /// Commit this step's diff is captured against.
    pub previous_commit: String,
    /// Fingerprint of the step definition.
    pub definition_hash: String,
    /// Adapter tag for rendering and output parsing.
    pub source: String,
}

/// Builds the commit message for a step.
fn commit_message(step: &StepDefinition) -> String {
    format!("{} (step {})", step.name, step.step_id)
}

async fn persist_step(
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

/// Executes one step of a run.
///
/// Returns the persisted step result; a non-zero agent exit yields a
/// `Failed` result, not an error. Errors are reserved for infrastructure
/// failures (diff or commit capture) that make the run unsafe to
/// continue.
pub async fn run_processing_step(
    octx: &OrchestratorContext,
    rctx: &RunContext,
    cancel: &CancelToken,
    input: StepInput,
) -> Result<StepResult, WorkflowError> {
    let step_id = input.step.step_id.clone();
    info!(
        run_id = %input.run_id,
        step_id = %step_id,
        step_index = input.step_index,
        "step: starting"
    );

    octx.publish_event(
        cancel,
        EngineEvent::PipelineStepStarted {
            project_id: input.project_id.clone(),
            run_id: input.run_id.clone(),
            step_id: step_id.clone(),
            step_index: input.step_index,
            step_name: input.step.name.clone(),
        },
    )
    .await;

    let mut result = StepResult::pending(
        input.run_id.clone(),
        step_id.clone(),
        input.step_index,
        input.definition_hash.clone(),
    );
    result.status = StepStatus::Running;
    persist_step(octx, cancel, &result).await?;

    // Render the argv (orchestrator queue; rendering is pure but adapter
    // selection is shared state).
    let argv = {
        let adapters = Arc::clone(&octx.adapters);
        let source = input.source.clone();
        let agent = input.step.agent.clone();
        let prompt = input.prompt.clone();
        octx.queue
            .execute(
                "RenderAgentCommand",
                &ActivityOptions::new(SHORT_TIMEOUT),
                cancel,
                move |_ctx| {
                    let adapters = Arc::clone(&adapters);
                    let source = source.clone();
                    let agent = agent.clone();
                    let prompt = prompt.clone();
                    async move {
                        let adapter = adapters
                            .get(&source)
                            .ok_or_else(|| ActivityError::non_retryable(format!(
                                "no adapter for source '{}'",
                                source
                            )))?;
                        let config = agent.ok_or_else(|| {
                            ActivityError::non_retryable("step has no agent config")
                        })?;
                        Ok(adapter.render_argv(&config, &prompt))
                    }
                },
            )
            .await?
    };

    // Execute the agent on the run-scoped queue. A failed attempt is not
    // retried: a half-run agent may have mutated the worktree.
    let exec_opts = ActivityOptions::new(octx.config.step_timeout)
        .with_heartbeat(EXEC_HEARTBEAT)
        .with_retry(RetryPolicy::no_retries());
    let request = ExecuteRequest::new(argv, input.worktree_path.clone())
        .with_prefix(rctx.command_prefix.clone());
    let execution = rctx
        .queue
        .execute("LocalExecute", &exec_opts, cancel, move |ctx| {
            let request = request.clone();
            async move {
                local_execute(request, ctx).await.map_err(|err| match err {
                    crate::error::ExecError::Cancelled => ActivityError::Cancelled,
                    other => ActivityError::failed(other),
                })
            }
        })
        .await?;

    result.duration = execution.duration;

    if !execution.success {
        warn!(
            run_id = %input.run_id,
            step_id = %step_id,
            exit_code = execution.exit_code,
            "step: agent exited non-zero"
        );
        result.status = StepStatus::Failed;
        result.error_message = Some(format!(
            "agent exited with code {}: {}",
            execution.exit_code,
            preview(execution.stderr.trim(), ERROR_PREVIEW)
        ));
        result.agent_output = Some(execution.stdout);
        persist_step(octx, cancel, &result).await?;
        octx.publish_event(
            cancel,
            EngineEvent::PipelineStepFailed {
                project_id: input.project_id.clone(),
                run_id: input.run_id.clone(),
                step_result: Box::new(result.clone()),
            },
        )
        .await;
        return Ok(result);
    }

    // Capture the diff. A failure here is fatal to the run: without diff
    // metadata the run is not idempotent-safe.
    let diff: DiffSummary = {
        let repo = Arc::clone(&octx.repo);
        let worktree = input.worktree_path.clone();
        octx.queue
            .execute(
                "CaptureDiff",
                &ActivityOptions::new(GIT_TIMEOUT),
                cancel,
                move |_ctx| {
                    let repo = Arc::clone(&repo);
                    let worktree = worktree.clone();
                    async move { repo.diff(&worktree).await.map_err(ActivityError::failed) }
                },
            )
            .await?
    };

    // Commit the changed files. A step that changed nothing keeps the
    // previous commit as its chain position.
    let commit_sha = if diff.has_changes {
        let repo = Arc::clone(&octx.repo);
        let worktree = input.worktree_path.clone();
        let files = diff.files.clone();
        let message = commit_message(&input.step);
        let sha = octx
            .queue
            .execute(
                "CommitStep",
                &ActivityOptions::new(GIT_TIMEOUT),
                cancel,
                move |_ctx| {
                    let repo = Arc::clone(&repo);
                    let worktree = worktree.clone();
                    let files = files.clone();
                    let message = message.clone();
                    async move {
                        repo.commit(&worktree, &files, &message)
                            .await
                            .map_err(ActivityError::failed)
                    }
                },
            )
            .await?;
        result.commit_message = Some(commit_message(&input.step));
        sha
    } else {
        info!(
            run_id = %input.run_id,
            step_id = %step_id,
            "step: no changes, keeping previous commit"
        );
        input.previous_commit.clone()
    };

    // Token counters and the final answer come from the agent's stdout.
    let final_output = octx
        .adapters
        .get(&input.source)
        .map(|adapter| adapter.parse_final_output(&execution.stdout))
        .unwrap_or_default();

    result.status = StepStatus::Completed;
    result.commit_sha = Some(commit_sha);
    result.git_diff = Some(diff.raw);
    result.files_changed = diff.files;
    result.insertions = diff.insertions;
    result.deletions = diff.deletions;
    result.tokens = final_output.tokens;
    result.agent_output = final_output.text.or(Some(execution.stdout));

    persist_step(octx, cancel, &result).await?;
    octx.publish_event(
        cancel,
        EngineEvent::PipelineStepCompleted {
            project_id: input.project_id.clone(),
            run_id: input.run_id.clone(),
            step_result: Box::new(result.clone()),
        },
    )
    .await;

    info!(
        run_id = %input.run_id,
        step_id = %step_id,
        commit = result.commit_sha.as_deref().unwrap_or(""),
        files = result.files_changed.len(),
        "step: completed"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_message_format() {
        let step = StepDefinition::new("lint", "Lint pass");
        assert_eq!(commit_message(&step), "Lint pass (step lint)");
    }
}
