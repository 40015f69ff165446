//! Pipeline runs.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    /// Stable string form used by the storage layer.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    /// Parses the storage form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    /// True for Completed and Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A specific execution of a pipeline definition against a project.
///
/// Created by the setup workflow, mutated by the pipeline workflow, and
/// never deleted by the engine itself: failed runs are retained for
/// diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Run identifier (caller-supplied or freshly generated).
    pub id: String,
    /// Pipeline definition this run executes.
    pub pipeline_id: String,
    /// Owning project.
    pub project_id: String,
    /// Human-readable run name.
    pub name: String,
    /// Lifecycle status.
    pub status: RunStatus,

    /// Parent run when this run was forked.
    pub parent_run_id: Option<String>,
    /// Last inherited step when forked.
    pub fork_after_step_id: Option<String>,
    /// Commit the first executed step starts from (the fork point's commit,
    /// or the base commit for a fresh run).
    pub start_commit_sha: Option<String>,

    /// Branch the run's worktree is checked out on.
    pub branch_name: Option<String>,
    /// Commit before any step ran.
    pub base_commit_sha: Option<String>,
    /// Commit after the final step.
    pub head_commit_sha: Option<String>,

    /// Prompt prefix in effect for every step.
    pub prompt_prefix: String,
    /// Prompt suffix in effect for every step.
    pub prompt_suffix: String,
    /// Fingerprint over everything that determines the run's output.
    pub identity_hash: String,

    /// Isolated worktree the agent operates in.
    pub worktree_path: Option<PathBuf>,
    /// Container hosting the run worker.
    pub container_id: Option<String>,
    /// Durable workflow execution id.
    pub workflow_id: Option<String>,

    /// Failure reason, when status is Failed.
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Creates a pending run skeleton.
    pub fn new(
        id: impl Into<String>,
        pipeline_id: impl Into<String>,
        project_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            pipeline_id: pipeline_id.into(),
            project_id: project_id.into(),
            name: name.into(),
            status: RunStatus::Pending,
            parent_run_id: None,
            fork_after_step_id: None,
            start_commit_sha: None,
            branch_name: None,
            base_commit_sha: None,
            head_commit_sha: None,
            prompt_prefix: String::new(),
            prompt_suffix: String::new(),
            identity_hash: String::new(),
            worktree_path: None,
            container_id: None,
            workflow_id: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Marks the run failed with the given reason.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.error_message = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    /// Marks the run completed at the given head commit.
    pub fn mark_completed(&mut self, head_commit: impl Into<String>) {
        self.status = RunStatus::Completed;
        self.head_commit_sha = Some(head_commit.into());
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_round_trip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert!(RunStatus::Completed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_mark_failed() {
        let mut run = PipelineRun::new("r1", "pl", "proj", "demo");
        run.mark_failed("Cancelled by user");

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("Cancelled by user"));
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_mark_completed() {
        let mut run = PipelineRun::new("r1", "pl", "proj", "demo");
        run.mark_completed("cafe");

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.head_commit_sha.as_deref(), Some("cafe"));
    }
}
