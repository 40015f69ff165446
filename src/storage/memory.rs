//! In-memory data service.
//!
//! Backs the integration tests and the `--memory` serve mode. Semantics
//! mirror the PostgreSQL implementation, including idempotent creates.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::model::{
    AiActivityRecord, PipelineRun, Project, StepResult, TokenUsage,
};

use super::{DataError, DataService, RunFilter};

#[derive(Default)]
struct Inner {
    projects: HashMap<String, Project>,
    runs: HashMap<String, PipelineRun>,
    steps: Vec<StepResult>,
    activities: Vec<AiActivityRecord>,
}

/// Mutex-guarded in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataService for MemoryStore {
    async fn upsert_project(&self, project: &Project) -> Result<(), DataError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.projects.insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>, DataError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.projects.get(id).cloned())
    }

    async fn create_pipeline_run(&self, run: &PipelineRun) -> Result<(), DataError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.runs.entry(run.id.clone()).or_insert_with(|| run.clone());
        Ok(())
    }

    async fn update_pipeline_run(&self, run: &PipelineRun) -> Result<(), DataError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.runs.contains_key(&run.id) {
            return Err(DataError::NotFound(format!("pipeline run {}", run.id)));
        }
        inner.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_pipeline_run(&self, id: &str) -> Result<Option<PipelineRun>, DataError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.runs.get(id).cloned())
    }

    async fn get_latest_pipeline_run(
        &self,
        project_id: &str,
        pipeline_id: &str,
    ) -> Result<Option<PipelineRun>, DataError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .runs
            .values()
            .filter(|r| r.project_id == project_id && r.pipeline_id == pipeline_id)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn list_runs_for_project(
        &self,
        project_id: &str,
        filter: &RunFilter,
    ) -> Result<Vec<PipelineRun>, DataError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut runs: Vec<PipelineRun> = inner
            .runs
            .values()
            .filter(|r| r.project_id == project_id)
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .filter(|r| {
                filter
                    .pipeline_id
                    .as_ref()
                    .is_none_or(|p| &r.pipeline_id == p)
            })
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            runs.truncate(limit.max(0) as usize);
        }
        Ok(runs)
    }

    async fn create_step_result(&self, result: &StepResult) -> Result<(), DataError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = inner.steps.iter_mut().find(|s| {
            s.pipeline_run_id == result.pipeline_run_id && s.step_index == result.step_index
        }) {
            *existing = result.clone();
        } else {
            inner.steps.push(result.clone());
        }
        Ok(())
    }

    async fn update_step_result(&self, result: &StepResult) -> Result<(), DataError> {
        self.create_step_result(result).await
    }

    async fn get_step_result(&self, id: &str) -> Result<Option<StepResult>, DataError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.steps.iter().find(|s| s.id == id).cloned())
    }

    async fn list_step_results(&self, run_id: &str) -> Result<Vec<StepResult>, DataError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut steps: Vec<StepResult> = inner
            .steps
            .iter()
            .filter(|s| s.pipeline_run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_index);
        Ok(steps)
    }

    async fn save_activity_record(&self, record: &AiActivityRecord) -> Result<(), DataError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.activities.iter().any(|a| a.event_id == record.event_id) {
            inner.activities.push(record.clone());
        }
        Ok(())
    }

    async fn update_activity_record(&self, record: &AiActivityRecord) -> Result<(), DataError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = inner
            .activities
            .iter_mut()
            .find(|a| a.event_id == record.event_id)
        {
            *existing = record.clone();
        } else {
            inner.activities.push(record.clone());
        }
        Ok(())
    }

    async fn get_activity_by_run(
        &self,
        run_id: &str,
    ) -> Result<Vec<AiActivityRecord>, DataError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .activities
            .iter()
            .filter(|a| a.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn get_activity_by_task(
        &self,
        task_id: &str,
    ) -> Result<Vec<AiActivityRecord>, DataError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .activities
            .iter()
            .filter(|a| a.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn token_totals_by_task(&self, task_id: &str) -> Result<TokenUsage, DataError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut totals = TokenUsage::default();
        for activity in inner.activities.iter().filter(|a| a.task_id == task_id) {
            totals.add(&activity.tokens);
        }
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunStatus, StepStatus};
    use chrono::Utc;

    #[tokio::test]
    async fn test_run_round_trip() {
        let store = MemoryStore::new();
        let mut run = PipelineRun::new("r1", "pl", "proj", "demo");
        store.create_pipeline_run(&run).await.unwrap();

        run.status = RunStatus::Running;
        store.update_pipeline_run(&run).await.unwrap();

        let loaded = store.get_pipeline_run("r1").await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_create_run_is_idempotent() {
        let store = MemoryStore::new();
        let mut run = PipelineRun::new("r1", "pl", "proj", "demo");
        run.status = RunStatus::Running;
        store.create_pipeline_run(&run).await.unwrap();

        // A retried create must not clobber the stored row.
        let fresh = PipelineRun::new("r1", "pl", "proj", "demo");
        store.create_pipeline_run(&fresh).await.unwrap();

        let loaded = store.get_pipeline_run("r1").await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_update_missing_run_errors() {
        let store = MemoryStore::new();
        let run = PipelineRun::new("ghost", "pl", "proj", "demo");
        assert!(matches!(
            store.update_pipeline_run(&run).await,
            Err(DataError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_step_results_ordered_by_index() {
        let store = MemoryStore::new();
        let run = PipelineRun::new("r1", "pl", "proj", "demo");
        store.create_pipeline_run(&run).await.unwrap();

        for index in [2usize, 0, 1] {
            let result = StepResult::pending("r1", format!("s{}", index), index, "hash");
            store.create_step_result(&result).await.unwrap();
        }

        let steps = store.list_step_results("r1").await.unwrap();
        let indices: Vec<usize> = steps.iter().map(|s| s.step_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_step_upsert_by_run_and_index() {
        let store = MemoryStore::new();
        let mut result = StepResult::pending("r1", "s0", 0, "hash");
        store.create_step_result(&result).await.unwrap();

        result.status = StepStatus::Completed;
        result.commit_sha = Some("abc".to_string());
        store.update_step_result(&result).await.unwrap();

        let steps = store.list_step_results("r1").await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_token_totals() {
        let store = MemoryStore::new();
        for i in 0..2 {
            let mut rec = AiActivityRecord::raw(
                format!("ev-{}", i),
                "r1-s0",
                "r1",
                "s0",
                "proj",
                "claude",
                "{}",
                Utc::now(),
            );
            rec.tokens.input_tokens = 10;
            rec.tokens.output_tokens = 4;
            store.save_activity_record(&rec).await.unwrap();
        }

        let totals = store.token_totals_by_task("r1-s0").await.unwrap();
        assert_eq!(totals.input_tokens, 20);
        assert_eq!(totals.output_tokens, 8);
    }

    #[tokio::test]
    async fn test_latest_run_wins_by_created_at() {
        let store = MemoryStore::new();
        let mut older = PipelineRun::new("old", "pl", "proj", "demo");
        older.created_at = Utc::now() - chrono::Duration::minutes(5);
        let newer = PipelineRun::new("new", "pl", "proj", "demo");
        store.create_pipeline_run(&older).await.unwrap();
        store.create_pipeline_run(&newer).await.unwrap();

        let latest = store
            .get_latest_pipeline_run("proj", "pl")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, "new");
    }
}
