//! Fork resolution: reuse a matching prefix of a previous run.
//!
//! A fork is valid only over a contiguous prefix whose step definition
//! hashes match the parent's persisted step results, with identical
//! prompt prefix/suffix. Auto-fork synthesises a directive from the most
//! recent completed runs when the caller did not name a parent.

use std::sync::Arc;

use tracing::{debug, info};

use crate::identity::step_definition_hash;
use crate::model::{RunStatus, StepDefinition, StepResult, StepStatus};
use crate::storage::{DataService, RunFilter};

use super::WorkflowError;

/// How many recent runs auto-fork scans.
const AUTO_FORK_SCAN_LIMIT: i64 = 20;

/// Caller-supplied fork directive.
#[derive(Debug, Clone)]
pub struct ForkDirective {
    pub parent_run_id: String,
    pub fork_after_step_id: String,
}

/// Resolved fork plan.
#[derive(Debug, Clone)]
pub struct ForkPlan {
    pub parent_run_id: String,
    pub fork_after_step_id: String,
    /// Index of the last inherited step.
    pub fork_after_index: usize,
    /// Commit the first executed step starts from.
    pub start_commit_sha: String,
    /// Parent step results over the inherited prefix, in index order.
    pub inherited: Vec<StepResult>,
}

/// Reads the commit a run's history reached after the given step.
pub async fn commit_after_step(
    data: &dyn DataService,
    run_id: &str,
    step_id: &str,
) -> Result<String, WorkflowError> {
    let results = data
        .list_step_results(run_id)
        .await
        .map_err(|e| WorkflowError::ForkValidation(e.to_string()))?;

    let target = results
        .iter()
        .find(|r| r.step_id == step_id)
        .ok_or_else(|| {
            WorkflowError::ForkValidation(format!(
                "run '{}' has no step result for step '{}'",
                run_id, step_id
            ))
        })?;

    target.commit_sha.clone().ok_or_else(|| {
        WorkflowError::ForkValidation(format!(
            "step '{}' of run '{}' has no commit to fork from",
            step_id, run_id
        ))
    })
}

/// Validates a fork directive against the parent run and produces the
/// plan. Strict: the first mismatch aborts with a descriptive error.
pub async fn resolve_fork(
    data: &dyn DataService,
    directive: &ForkDirective,
    steps: &[StepDefinition],
    prompt_prefix: &str,
    prompt_suffix: &str,
) -> Result<ForkPlan, WorkflowError> {
    let parent = data
        .get_pipeline_run(&directive.parent_run_id)
        .await
        .map_err(|e| WorkflowError::ForkValidation(e.to_string()))?
        .ok_or_else(|| {
            WorkflowError::ForkValidation(format!(
                "parent run '{}' not found",
                directive.parent_run_id
            ))
        })?;

    if parent.prompt_prefix != prompt_prefix || parent.prompt_suffix != prompt_suffix {
        return Err(WorkflowError::ForkValidation(format!(
            "prompt prefix/suffix differ from parent run '{}'",
            parent.id
        )));
    }

    let fork_after_index = steps
        .iter()
        .position(|s| s.step_id == directive.fork_after_step_id)
        .ok_or_else(|| {
            WorkflowError::ForkValidation(format!(
                "fork_after_step_id '{}' is not a step of the new pipeline",
                directive.fork_after_step_id
            ))
        })?;

    let parent_results = data
        .list_step_results(&parent.id)
        .await
        .map_err(|e| WorkflowError::ForkValidation(e.to_string()))?;

    let mut inherited = Vec::with_capacity(fork_after_index + 1);
    for (index, step) in steps.iter().take(fork_after_index + 1).enumerate() {
        let parent_result = parent_results.get(index).ok_or_else(|| {
            WorkflowError::ForkValidation(format!(
                "parent run '{}' has no step result at index {}",
                parent.id, index
            ))
        })?;

        let new_hash = step_definition_hash(step);
        if parent_result.definition_hash != new_hash {
            return Err(WorkflowError::ForkValidation(format!(
                "step '{}' (index {}) differs from parent run '{}': \
                 definition hash {} != {}",
                step.step_id, index, parent.id, new_hash, parent_result.definition_hash
            )));
        }
        if !matches!(
            parent_result.status,
            StepStatus::Completed | StepStatus::Skipped
        ) {
            return Err(WorkflowError::ForkValidation(format!(
                "parent step '{}' is {} and cannot be inherited",
                parent_result.step_id, parent_result.status
            )));
        }
        inherited.push(parent_result.clone());
    }

    let start_commit_sha =
        commit_after_step(data, &parent.id, &directive.fork_after_step_id).await?;

    info!(
        parent_run_id = %parent.id,
        fork_after = %directive.fork_after_step_id,
        start_commit = %start_commit_sha,
        "fork: resolved"
    );

    Ok(ForkPlan {
        parent_run_id: parent.id,
        fork_after_step_id: directive.fork_after_step_id.clone(),
        fork_after_index,
        start_commit_sha,
        inherited,
    })
}

/// Length of the contiguous matching prefix between new steps and a
/// candidate run's results.
fn matching_prefix_len(steps: &[StepDefinition], results: &[StepResult]) -> usize {
    let mut len = 0;
    for (index, step) in steps.iter().enumerate() {
        let Some(result) = results.get(index) else { break };
        if result.definition_hash != step_definition_hash(step) {
            break;
        }
        if !matches!(result.status, StepStatus::Completed | StepStatus::Skipped) {
            break;
        }
        if result.commit_sha.is_none() {
            break;
        }
        len += 1;
    }
    len
}

/// Scans recent completed runs for the longest reusable prefix and
/// synthesises a fork directive from it. Conservative: prompt wrappers
/// and base commit must match exactly.
pub async fn auto_fork(
    data: &Arc<dyn DataService>,
    project_id: &str,
    pipeline_id: &str,
    steps: &[StepDefinition],
    prompt_prefix: &str,
    prompt_suffix: &str,
    base_commit: &str,
) -> Result<Option<ForkDirective>, WorkflowError> {
    let filter = RunFilter::new()
        .with_status(RunStatus::Completed)
        .with_pipeline_id(pipeline_id)
        .with_limit(AUTO_FORK_SCAN_LIMIT);
    let candidates = data
        .list_runs_for_project(project_id, &filter)
        .await
        .map_err(|e| WorkflowError::ForkValidation(e.to_string()))?;

    let mut best: Option<(usize, ForkDirective)> = None;
    for candidate in candidates {
        if candidate.prompt_prefix != prompt_prefix || candidate.prompt_suffix != prompt_suffix {
            continue;
        }
        if candidate.base_commit_sha.as_deref() != Some(base_commit) {
            continue;
        }

        let results = data
            .list_step_results(&candidate.id)
            .await
            .map_err(|e| WorkflowError::ForkValidation(e.to_string()))?;
        let prefix_len = matching_prefix_len(steps, &results);
        if prefix_len == 0 {
            continue;
        }
        // The whole pipeline matching is a replay concern, not a fork.
        let prefix_len = prefix_len.min(steps.len().saturating_sub(1));
        if prefix_len == 0 {
            continue;
        }

        if best.as_ref().is_none_or(|(len, _)| prefix_len > *len) {
            best = Some((
                prefix_len,
                ForkDirective {
                    parent_run_id: candidate.id.clone(),
                    fork_after_step_id: steps[prefix_len - 1].step_id.clone(),
                },
            ));
        }
    }

    if let Some((len, directive)) = best {
        debug!(
            parent_run_id = %directive.parent_run_id,
            prefix_len = len,
            "auto-fork: found reusable prefix"
        );
        Ok(Some(directive))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentConfig, PipelineRun};
    use crate::storage::MemoryStore;

    fn step(id: &str, prompt: &str) -> StepDefinition {
        StepDefinition::new(id, format!("Step {}", id))
            .with_agent(AgentConfig::new("claude", prompt))
    }

    fn completed_result(run_id: &str, def: &StepDefinition, index: usize, sha: &str) -> StepResult {
        let mut result =
            StepResult::pending(run_id, def.step_id.clone(), index, step_definition_hash(def));
        result.status = StepStatus::Completed;
        result.commit_sha = Some(sha.to_string());
        result
    }

    async fn seed_parent(
        data: &MemoryStore,
        run_id: &str,
        steps: &[StepDefinition],
        base_commit: &str,
    ) {
        let mut run = PipelineRun::new(run_id, "pl", "proj", "demo");
        run.status = RunStatus::Completed;
        run.base_commit_sha = Some(base_commit.to_string());
        data.create_pipeline_run(&run).await.unwrap();
        for (i, s) in steps.iter().enumerate() {
            data.create_step_result(&completed_result(run_id, s, i, &format!("sha-{}", i)))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_resolve_fork_happy_path() {
        let data = MemoryStore::new();
        let steps = vec![step("s1", "one"), step("s2", "two")];
        seed_parent(&data, "parent", &steps, "base").await;

        let directive = ForkDirective {
            parent_run_id: "parent".to_string(),
            fork_after_step_id: "s1".to_string(),
        };
        let plan = resolve_fork(&data, &directive, &steps, "", "").await.unwrap();

        assert_eq!(plan.fork_after_index, 0);
        assert_eq!(plan.start_commit_sha, "sha-0");
        assert_eq!(plan.inherited.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_fork_rejects_changed_prefix() {
        let data = MemoryStore::new();
        let parent_steps = vec![step("s1", "one"), step("s2", "two")];
        seed_parent(&data, "parent", &parent_steps, "base").await;

        // Same ids, different prompt in the inherited step.
        let new_steps = vec![step("s1", "one CHANGED"), step("s2", "two")];
        let directive = ForkDirective {
            parent_run_id: "parent".to_string(),
            fork_after_step_id: "s1".to_string(),
        };
        let err = resolve_fork(&data, &directive, &new_steps, "", "")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ForkValidation(_)));
        assert!(err.to_string().contains("s1"));
    }

    #[tokio::test]
    async fn test_resolve_fork_rejects_prompt_wrapper_change() {
        let data = MemoryStore::new();
        let steps = vec![step("s1", "one"), step("s2", "two")];
        seed_parent(&data, "parent", &steps, "base").await;

        let directive = ForkDirective {
            parent_run_id: "parent".to_string(),
            fork_after_step_id: "s1".to_string(),
        };
        let err = resolve_fork(&data, &directive, &steps, "be brief ", "")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("prompt prefix/suffix"));
    }

    #[tokio::test]
    async fn test_auto_fork_finds_longest_prefix() {
        let store = Arc::new(MemoryStore::new());
        let shared = vec![step("s1", "one"), step("s2", "two")];
        seed_parent(&store, "parent", &shared, "base").await;
        let data: Arc<dyn DataService> = store;

        // New pipeline shares s1 and s2, changes s3.
        let new_steps = vec![step("s1", "one"), step("s2", "two"), step("s3", "three")];
        let directive = auto_fork(&data, "proj", "pl", &new_steps, "", "", "base")
            .await
            .unwrap()
            .expect("should find a fork");

        assert_eq!(directive.parent_run_id, "parent");
        assert_eq!(directive.fork_after_step_id, "s2");
    }

    #[tokio::test]
    async fn test_auto_fork_skips_other_base_commit() {
        let store = Arc::new(MemoryStore::new());
        let shared = vec![step("s1", "one")];
        seed_parent(&store, "parent", &shared, "other-base").await;
        let data: Arc<dyn DataService> = store;

        let new_steps = vec![step("s1", "one"), step("s2", "two")];
        let directive = auto_fork(&data, "proj", "pl", &new_steps, "", "", "base")
            .await
            .unwrap();
        assert!(directive.is_none());
    }

    #[tokio::test]
    async fn test_auto_fork_identical_pipeline_caps_before_last_step() {
        let store = Arc::new(MemoryStore::new());
        let steps = vec![step("s1", "one"), step("s2", "two")];
        seed_parent(&store, "parent", &steps, "base").await;
        let data: Arc<dyn DataService> = store;

        let directive = auto_fork(&data, "proj", "pl", &steps, "", "", "base")
            .await
            .unwrap()
            .expect("still forkable over the first step");
        assert_eq!(directive.fork_after_step_id, "s1");
    }
}
