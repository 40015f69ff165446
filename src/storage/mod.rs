//! Persistent storage for runs, step results, and AI activity records.
//!
//! The engine consumes the [`DataService`] trait; the PostgreSQL-backed
//! [`Database`] is the production implementation and [`MemoryStore`]
//! backs tests and the `--memory` serve mode.

mod database;
mod memory;
pub mod migrations;
pub mod schema;

pub use database::Database;
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{AiActivityRecord, PipelineRun, Project, RunStatus, StepResult, TokenUsage};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum DataError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A record with the same key already exists.
    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] migrations::MigrationError),

    /// A persisted value could not be interpreted.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Filter criteria for listing pipeline runs.
#[derive(Debug, Default, Clone)]
pub struct RunFilter {
    /// Filter by run status.
    pub status: Option<RunStatus>,
    /// Filter by pipeline definition.
    pub pipeline_id: Option<String>,
    /// Maximum number of results, newest first.
    pub limit: Option<i64>,
}

impl RunFilter {
    /// Creates a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status filter.
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the pipeline filter.
    pub fn with_pipeline_id(mut self, pipeline_id: impl Into<String>) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self
    }

    /// Sets the result limit.
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Storage operations the engine consumes.
#[async_trait]
pub trait DataService: Send + Sync {
    // Projects
    async fn upsert_project(&self, project: &Project) -> Result<(), DataError>;
    async fn get_project(&self, id: &str) -> Result<Option<Project>, DataError>;

    // Pipeline runs
    async fn create_pipeline_run(&self, run: &PipelineRun) -> Result<(), DataError>;
    async fn update_pipeline_run(&self, run: &PipelineRun) -> Result<(), DataError>;
    async fn get_pipeline_run(&self, id: &str) -> Result<Option<PipelineRun>, DataError>;
    async fn get_latest_pipeline_run(
        &self,
        project_id: &str,
        pipeline_id: &str,
    ) -> Result<Option<PipelineRun>, DataError>;
    async fn list_runs_for_project(
        &self,
        project_id: &str,
        filter: &RunFilter,
    ) -> Result<Vec<PipelineRun>, DataError>;

    // Step results
    async fn create_step_result(&self, result: &StepResult) -> Result<(), DataError>;
    async fn update_step_result(&self, result: &StepResult) -> Result<(), DataError>;
    async fn get_step_result(&self, id: &str) -> Result<Option<StepResult>, DataError>;
    /// Step results of a run, ordered by step index.
    async fn list_step_results(&self, run_id: &str) -> Result<Vec<StepResult>, DataError>;

    // AI activity
    async fn save_activity_record(&self, record: &AiActivityRecord) -> Result<(), DataError>;
    /// Updates the parsed fields of a record keyed by event id.
    async fn update_activity_record(&self, record: &AiActivityRecord) -> Result<(), DataError>;
    async fn get_activity_by_run(&self, run_id: &str) -> Result<Vec<AiActivityRecord>, DataError>;
    async fn get_activity_by_task(&self, task_id: &str)
        -> Result<Vec<AiActivityRecord>, DataError>;
    async fn token_totals_by_task(&self, task_id: &str) -> Result<TokenUsage, DataError>;
}
