//! Setup workflow: provision the isolated resources of a run.
//!
//! Order matters: worktree first, then container, then credentials, then
//! the persisted run row. Each acquired resource registers its
//! compensation before the next acquisition, so an injected failure at
//! any point rolls back exactly what was acquired, in reverse order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::container::{inject_tool_credentials, ContainerSpec, RUN_ID_LABEL};
use crate::identity::ORCHESTRATOR_QUEUE;
use crate::model::{PipelineRun, RunStatus};
use crate::runtime::{ActivityError, ActivityOptions, CancelToken};

use super::{CompensationStack, OrchestratorContext, WorkflowError};

/// Timeout for worktree git operations.
const WORKTREE_TIMEOUT: Duration = Duration::from_secs(120);
/// Timeout for container create/start (image may need pulling).
const CONTAINER_TIMEOUT: Duration = Duration::from_secs(300);
/// Timeout for persistence activities.
const PERSIST_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for each compensation.
const COMPENSATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Inputs to the setup workflow.
#[derive(Debug, Clone)]
pub struct SetupInput {
    /// The run skeleton; setup fills in resources and persists it.
    pub run: PipelineRun,
    /// Repository the worktree is created from.
    pub repository_path: PathBuf,
    /// Commit the worktree is checked out at (the fork point's commit for
    /// forked runs, the base commit otherwise).
    pub checkout_commit: String,
    /// Branch for the worktree; defaults to `pipeline/<run-id[..8]>`.
    pub branch_name: Option<String>,
    /// Adapter tag whose credentials are injected.
    pub source: String,
    /// Name of the run-scoped task queue.
    pub run_queue_name: String,
}

/// Outputs of the setup workflow.
#[derive(Debug, Clone)]
pub struct SetupOutput {
    /// The persisted run, with resources attached.
    pub run: PipelineRun,
    /// Host path of the run's worktree.
    pub worktree_path: PathBuf,
    /// Id of the run's container.
    pub container_id: String,
    /// Commit the first executed step starts from.
    pub start_commit_sha: String,
}

/// Derives the default branch name for a run.
pub fn default_branch_name(run_id: &str) -> String {
    let short = &run_id[..run_id.len().min(8)];
    format!("pipeline/{}", short)
}

/// Runs setup, registering compensations on `comp` as resources are
/// acquired. On error the caller runs the compensations and marks the
/// run failed.
pub async fn run_setup(
    octx: &OrchestratorContext,
    cancel: &CancelToken,
    comp: &mut CompensationStack,
    input: SetupInput,
) -> Result<SetupOutput, WorkflowError> {
    let run_id = input.run.id.clone();
    info!(run_id = %run_id, "setup: provisioning run resources");

    // Worktree path carries a timestamp so a retried run after manual
    // cleanup never collides with debris from the previous attempt.
    let worktree_path = input
        .repository_path
        .join(".worktrees")
        .join(format!("task-{}-{}", run_id, Utc::now().timestamp()));
    let branch = input
        .branch_name
        .clone()
        .unwrap_or_else(|| default_branch_name(&run_id));

    // 1. Worktree.
    {
        let repo = Arc::clone(&octx.repo);
        let repository_path = input.repository_path.clone();
        let checkout = input.checkout_commit.clone();
        let branch = branch.clone();
        let worktree = worktree_path.clone();
        octx.queue
            .execute(
                "CreateWorktree",
                &ActivityOptions::new(WORKTREE_TIMEOUT),
                cancel,
                move |_ctx| {
                    let repo = Arc::clone(&repo);
                    let repository_path = repository_path.clone();
                    let checkout = checkout.clone();
                    let branch = branch.clone();
                    let worktree = worktree.clone();
                    async move {
                        repo.create_worktree(&repository_path, &checkout, &branch, &worktree)
                            .await
                            .map_err(ActivityError::failed)
                    }
                },
            )
            .await?;
    }
    {
        let queue = octx.queue.clone();
        let repo = Arc::clone(&octx.repo);
        let repository_path = input.repository_path.clone();
        let worktree = worktree_path.clone();
        let detached = cancel.disconnected();
        comp.push("remove-worktree", move || async move {
            queue
                .execute(
                    "RemoveWorktree",
                    &ActivityOptions::compensation(COMPENSATION_TIMEOUT),
                    &detached,
                    move |_ctx| {
                        let repo = Arc::clone(&repo);
                        let repository_path = repository_path.clone();
                        let worktree = worktree.clone();
                        async move {
                            repo.remove_worktree(&repository_path, &worktree)
                                .await
                                .map_err(ActivityError::failed)
                        }
                    },
                )
                .await
                .map_err(|e| e.to_string())
        });
    }

    // 2. Container.
    let spec = ContainerSpec::new(
        format!("pipeforge-run-{}", run_id),
        octx.config.container_image.clone(),
    )
    .with_command(octx.config.run_worker_command.clone())
    .with_workspace(octx.config.workspace_path.clone())
    .with_bind(&worktree_path, &octx.config.workspace_path)
    .with_env("RUN_ID", &run_id)
    .with_env("PROJECT_ID", &input.run.project_id)
    .with_env("PIPEFORGE_RUN_QUEUE", &input.run_queue_name)
    .with_env("PIPEFORGE_ORCHESTRATOR_QUEUE", ORCHESTRATOR_QUEUE)
    .with_label(RUN_ID_LABEL, &run_id);

    let container_id = {
        let containers = Arc::clone(&octx.containers);
        let spec = spec.clone();
        octx.queue
            .execute(
                "CreateContainer",
                &ActivityOptions::new(CONTAINER_TIMEOUT),
                cancel,
                move |_ctx| {
                    let containers = Arc::clone(&containers);
                    let spec = spec.clone();
                    async move {
                        let id = containers
                            .create(&spec)
                            .await
                            .map_err(ActivityError::failed)?;
                        containers.start(&id).await.map_err(ActivityError::failed)?;
                        Ok(id)
                    }
                },
            )
            .await?
    };
    {
        let queue = octx.queue.clone();
        let containers = Arc::clone(&octx.containers);
        let stop_timeout = octx.config.container_stop_timeout;
        let id = container_id.clone();
        let detached = cancel.disconnected();
        comp.push("stop-container", move || async move {
            queue
                .execute(
                    "StopContainer",
                    &ActivityOptions::compensation(COMPENSATION_TIMEOUT),
                    &detached,
                    move |_ctx| {
                        let containers = Arc::clone(&containers);
                        let id = id.clone();
                        async move {
                            containers
                                .stop(&id, stop_timeout)
                                .await
                                .map_err(ActivityError::failed)?;
                            containers
                                .delete(&id, true)
                                .await
                                .map_err(ActivityError::failed)
                        }
                    },
                )
                .await
                .map_err(|e| e.to_string())
        });
    }

    // 3. Credentials (best-effort, vendor specific).
    if let Some(adapter) = octx.adapters.get(&input.source) {
        let containers = Arc::clone(&octx.containers);
        let id = container_id.clone();
        octx.queue
            .execute(
                "InjectCredentials",
                &ActivityOptions::compensation(PERSIST_TIMEOUT),
                cancel,
                move |_ctx| {
                    let containers = Arc::clone(&containers);
                    let adapter = Arc::clone(&adapter);
                    let id = id.clone();
                    async move {
                        inject_tool_credentials(containers.as_ref(), &id, adapter.as_ref()).await;
                        Ok(())
                    }
                },
            )
            .await?;
    }

    // 4. Persist the run row.
    let mut run = input.run;
    run.status = RunStatus::Running;
    run.branch_name = Some(branch);
    run.worktree_path = Some(worktree_path.clone());
    run.container_id = Some(container_id.clone());
    run.started_at = Some(Utc::now());
    {
        let data = Arc::clone(&octx.data);
        let run = run.clone();
        octx.queue
            .execute(
                "PersistRun",
                &ActivityOptions::new(PERSIST_TIMEOUT),
                cancel,
                move |_ctx| {
                    let data = Arc::clone(&data);
                    let run = run.clone();
                    async move {
                        data.create_pipeline_run(&run)
                            .await
                            .map_err(ActivityError::failed)
                    }
                },
            )
            .await?;
    }

    let start_commit_sha = input.checkout_commit;
    info!(
        run_id = %run_id,
        worktree = %worktree_path.display(),
        container_id = %container_id,
        "setup: run resources ready"
    );

    Ok(SetupOutput {
        run,
        worktree_path,
        container_id,
        start_commit_sha,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_branch_name_uses_short_id() {
        assert_eq!(
            default_branch_name("0123456789abcdef"),
            "pipeline/01234567"
        );
        assert_eq!(default_branch_name("abc"), "pipeline/abc");
    }
}
