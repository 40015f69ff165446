//! PostgreSQL data service.
//!
//! Implements [`DataService`] over sqlx. Writes are plain upserts keyed by
//! the caller-supplied ids; the engine relies on activity retries, so
//! every operation here is idempotent.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::model::{
    AiActivityRecord, PipelineRun, Project, RunStatus, StepResult, StepStatus, TokenUsage,
};

use super::migrations::MigrationRunner;
use super::{DataError, DataService, RunFilter};

/// PostgreSQL database client.
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connects to the database and returns a new client.
    pub async fn connect(database_url: &str) -> Result<Self, DataError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| DataError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a new client from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), DataError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }
}

fn run_from_row(row: &PgRow) -> Result<PipelineRun, DataError> {
    let status_str: String = row.get("status");
    let status = RunStatus::parse(&status_str)
        .ok_or_else(|| DataError::Corrupt(format!("unknown run status '{}'", status_str)))?;
    let worktree_path: Option<String> = row.get("worktree_path");

    Ok(PipelineRun {
        id: row.get("id"),
        pipeline_id: row.get("pipeline_id"),
        project_id: row.get("project_id"),
        name: row.get("name"),
        status,
        parent_run_id: row.get("parent_run_id"),
        fork_after_step_id: row.get("fork_after_step_id"),
        start_commit_sha: row.get("start_commit_sha"),
        branch_name: row.get("branch_name"),
        base_commit_sha: row.get("base_commit_sha"),
        head_commit_sha: row.get("head_commit_sha"),
        prompt_prefix: row.get("prompt_prefix"),
        prompt_suffix: row.get("prompt_suffix"),
        identity_hash: row.get("identity_hash"),
        worktree_path: worktree_path.map(PathBuf::from),
        container_id: row.get("container_id"),
        workflow_id: row.get("workflow_id"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn step_from_row(row: &PgRow) -> Result<StepResult, DataError> {
    let status_str: String = row.get("status");
    let status = StepStatus::parse(&status_str)
        .ok_or_else(|| DataError::Corrupt(format!("unknown step status '{}'", status_str)))?;
    let files_json: serde_json::Value = row.get("files_changed");
    let files_changed: Vec<String> = serde_json::from_value(files_json)?;
    let step_index: i32 = row.get("step_index");
    let duration_ms: i64 = row.get("duration_ms");

    Ok(StepResult {
        id: row.get("id"),
        pipeline_run_id: row.get("pipeline_run_id"),
        step_id: row.get("step_id"),
        step_index: step_index as usize,
        status,
        commit_sha: row.get("commit_sha"),
        commit_message: row.get("commit_message"),
        git_diff: row.get("git_diff"),
        files_changed,
        insertions: row.get::<i64, _>("insertions") as u64,
        deletions: row.get::<i64, _>("deletions") as u64,
        tokens: tokens_from_row(row),
        agent_output: row.get("agent_output"),
        duration: Duration::from_millis(duration_ms as u64),
        error_message: row.get("error_message"),
        definition_hash: row.get("definition_hash"),
        created_at: row.get("created_at"),
    })
}

fn tokens_from_row(row: &PgRow) -> TokenUsage {
    TokenUsage {
        input_tokens: row.get::<i64, _>("input_tokens") as u64,
        output_tokens: row.get::<i64, _>("output_tokens") as u64,
        cache_read_tokens: row.get::<i64, _>("cache_read_tokens") as u64,
        cache_creation_tokens: row.get::<i64, _>("cache_creation_tokens") as u64,
    }
}

fn activity_from_row(row: &PgRow) -> AiActivityRecord {
    let timestamp: DateTime<Utc> = row.get("timestamp");
    AiActivityRecord {
        event_id: row.get("event_id"),
        task_id: row.get("task_id"),
        run_id: row.get("run_id"),
        step_id: row.get("step_id"),
        project_id: row.get("project_id"),
        source: row.get("source"),
        event_type: row.get("event_type"),
        timestamp,
        tool_name: row.get("tool_name"),
        input_summary: row.get("input_summary"),
        content_preview: row.get("content_preview"),
        tokens: tokens_from_row(row),
        raw_payload: row.get("raw_payload"),
    }
}

#[async_trait::async_trait]
impl DataService for Database {
    async fn upsert_project(&self, project: &Project) -> Result<(), DataError> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, repository_path)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                repository_path = EXCLUDED.repository_path
            "#,
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(project.repository_path.to_string_lossy().as_ref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>, DataError> {
        let row = sqlx::query("SELECT id, name, repository_path FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| Project {
            id: r.get("id"),
            name: r.get("name"),
            repository_path: PathBuf::from(r.get::<String, _>("repository_path")),
        }))
    }

    async fn create_pipeline_run(&self, run: &PipelineRun) -> Result<(), DataError> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (
                id, pipeline_id, project_id, name, status,
                parent_run_id, fork_after_step_id, start_commit_sha,
                branch_name, base_commit_sha, head_commit_sha,
                prompt_prefix, prompt_suffix, identity_hash,
                worktree_path, container_id, workflow_id, error_message,
                created_at, started_at, completed_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18, $19, $20, $21
            )
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&run.id)
        .bind(&run.pipeline_id)
        .bind(&run.project_id)
        .bind(&run.name)
        .bind(run.status.as_str())
        .bind(&run.parent_run_id)
        .bind(&run.fork_after_step_id)
        .bind(&run.start_commit_sha)
        .bind(&run.branch_name)
        .bind(&run.base_commit_sha)
        .bind(&run.head_commit_sha)
        .bind(&run.prompt_prefix)
        .bind(&run.prompt_suffix)
        .bind(&run.identity_hash)
        .bind(run.worktree_path.as_ref().map(|p| p.to_string_lossy().to_string()))
        .bind(&run.container_id)
        .bind(&run.workflow_id)
        .bind(&run.error_message)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_pipeline_run(&self, run: &PipelineRun) -> Result<(), DataError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_runs SET
                status = $2,
                parent_run_id = $3,
                fork_after_step_id = $4,
                start_commit_sha = $5,
                branch_name = $6,
                base_commit_sha = $7,
                head_commit_sha = $8,
                worktree_path = $9,
                container_id = $10,
                workflow_id = $11,
                error_message = $12,
                started_at = $13,
                completed_at = $14
            WHERE id = $1
            "#,
        )
        .bind(&run.id)
        .bind(run.status.as_str())
        .bind(&run.parent_run_id)
        .bind(&run.fork_after_step_id)
        .bind(&run.start_commit_sha)
        .bind(&run.branch_name)
        .bind(&run.base_commit_sha)
        .bind(&run.head_commit_sha)
        .bind(run.worktree_path.as_ref().map(|p| p.to_string_lossy().to_string()))
        .bind(&run.container_id)
        .bind(&run.workflow_id)
        .bind(&run.error_message)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DataError::NotFound(format!("pipeline run {}", run.id)));
        }
        Ok(())
    }

    async fn get_pipeline_run(&self, id: &str) -> Result<Option<PipelineRun>, DataError> {
        let row = sqlx::query("SELECT * FROM pipeline_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn get_latest_pipeline_run(
        &self,
        project_id: &str,
        pipeline_id: &str,
    ) -> Result<Option<PipelineRun>, DataError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM pipeline_runs
            WHERE project_id = $1 AND pipeline_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(project_id)
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs_for_project(
        &self,
        project_id: &str,
        filter: &RunFilter,
    ) -> Result<Vec<PipelineRun>, DataError> {
        let mut query = String::from("SELECT * FROM pipeline_runs WHERE project_id = $1");
        let mut param_idx = 2;

        if filter.status.is_some() {
            query.push_str(&format!(" AND status = ${}", param_idx));
            param_idx += 1;
        }
        if filter.pipeline_id.is_some() {
            query.push_str(&format!(" AND pipeline_id = ${}", param_idx));
            param_idx += 1;
        }
        query.push_str(" ORDER BY created_at DESC");
        if filter.limit.is_some() {
            query.push_str(&format!(" LIMIT ${}", param_idx));
        }

        let mut sqlx_query = sqlx::query(&query).bind(project_id);
        if let Some(status) = filter.status {
            sqlx_query = sqlx_query.bind(status.as_str());
        }
        if let Some(ref pipeline_id) = filter.pipeline_id {
            sqlx_query = sqlx_query.bind(pipeline_id);
        }
        if let Some(limit) = filter.limit {
            sqlx_query = sqlx_query.bind(limit);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn create_step_result(&self, result: &StepResult) -> Result<(), DataError> {
        let files_json = serde_json::to_value(&result.files_changed)?;
        sqlx::query(
            r#"
            INSERT INTO step_results (
                id, pipeline_run_id, step_id, step_index, status,
                commit_sha, commit_message, git_diff, files_changed,
                insertions, deletions,
                input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens,
                agent_output, duration_ms, error_message, definition_hash, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18, $19, $20
            )
            ON CONFLICT (pipeline_run_id, step_index) DO UPDATE SET
                status = EXCLUDED.status,
                commit_sha = EXCLUDED.commit_sha,
                commit_message = EXCLUDED.commit_message,
                git_diff = EXCLUDED.git_diff,
                files_changed = EXCLUDED.files_changed,
                insertions = EXCLUDED.insertions,
                deletions = EXCLUDED.deletions,
                input_tokens = EXCLUDED.input_tokens,
                output_tokens = EXCLUDED.output_tokens,
                cache_read_tokens = EXCLUDED.cache_read_tokens,
                cache_creation_tokens = EXCLUDED.cache_creation_tokens,
                agent_output = EXCLUDED.agent_output,
                duration_ms = EXCLUDED.duration_ms,
                error_message = EXCLUDED.error_message,
                definition_hash = EXCLUDED.definition_hash
            "#,
        )
        .bind(&result.id)
        .bind(&result.pipeline_run_id)
        .bind(&result.step_id)
        .bind(result.step_index as i32)
        .bind(result.status.as_str())
        .bind(&result.commit_sha)
        .bind(&result.commit_message)
        .bind(&result.git_diff)
        .bind(&files_json)
        .bind(result.insertions as i64)
        .bind(result.deletions as i64)
        .bind(result.tokens.input_tokens as i64)
        .bind(result.tokens.output_tokens as i64)
        .bind(result.tokens.cache_read_tokens as i64)
        .bind(result.tokens.cache_creation_tokens as i64)
        .bind(&result.agent_output)
        .bind(result.duration.as_millis() as i64)
        .bind(&result.error_message)
        .bind(&result.definition_hash)
        .bind(result.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_step_result(&self, result: &StepResult) -> Result<(), DataError> {
        // Create is an upsert keyed by (run, index); updates reuse it.
        self.create_step_result(result).await
    }

    async fn get_step_result(&self, id: &str) -> Result<Option<StepResult>, DataError> {
        let row = sqlx::query("SELECT * FROM step_results WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(step_from_row).transpose()
    }

    async fn list_step_results(&self, run_id: &str) -> Result<Vec<StepResult>, DataError> {
        let rows = sqlx::query(
            "SELECT * FROM step_results WHERE pipeline_run_id = $1 ORDER BY step_index",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(step_from_row).collect()
    }

    async fn save_activity_record(&self, record: &AiActivityRecord) -> Result<(), DataError> {
        sqlx::query(
            r#"
            INSERT INTO ai_activity_records (
                event_id, task_id, run_id, step_id, project_id, source,
                event_type, timestamp, tool_name, input_summary, content_preview,
                input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens,
                raw_payload
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16
            )
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&record.event_id)
        .bind(&record.task_id)
        .bind(&record.run_id)
        .bind(&record.step_id)
        .bind(&record.project_id)
        .bind(&record.source)
        .bind(&record.event_type)
        .bind(record.timestamp)
        .bind(&record.tool_name)
        .bind(&record.input_summary)
        .bind(&record.content_preview)
        .bind(record.tokens.input_tokens as i64)
        .bind(record.tokens.output_tokens as i64)
        .bind(record.tokens.cache_read_tokens as i64)
        .bind(record.tokens.cache_creation_tokens as i64)
        .bind(&record.raw_payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_activity_record(&self, record: &AiActivityRecord) -> Result<(), DataError> {
        sqlx::query(
            r#"
            INSERT INTO ai_activity_records (
                event_id, task_id, run_id, step_id, project_id, source,
                event_type, timestamp, tool_name, input_summary, content_preview,
                input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens,
                raw_payload
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16
            )
            ON CONFLICT (event_id) DO UPDATE SET
                event_type = EXCLUDED.event_type,
                tool_name = EXCLUDED.tool_name,
                input_summary = EXCLUDED.input_summary,
                content_preview = EXCLUDED.content_preview,
                input_tokens = EXCLUDED.input_tokens,
                output_tokens = EXCLUDED.output_tokens,
                cache_read_tokens = EXCLUDED.cache_read_tokens,
                cache_creation_tokens = EXCLUDED.cache_creation_tokens
            "#,
        )
        .bind(&record.event_id)
        .bind(&record.task_id)
        .bind(&record.run_id)
        .bind(&record.step_id)
        .bind(&record.project_id)
        .bind(&record.source)
        .bind(&record.event_type)
        .bind(record.timestamp)
        .bind(&record.tool_name)
        .bind(&record.input_summary)
        .bind(&record.content_preview)
        .bind(record.tokens.input_tokens as i64)
        .bind(record.tokens.output_tokens as i64)
        .bind(record.tokens.cache_read_tokens as i64)
        .bind(record.tokens.cache_creation_tokens as i64)
        .bind(&record.raw_payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_activity_by_run(
        &self,
        run_id: &str,
    ) -> Result<Vec<AiActivityRecord>, DataError> {
        let rows = sqlx::query(
            "SELECT * FROM ai_activity_records WHERE run_id = $1 ORDER BY timestamp",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(activity_from_row).collect())
    }

    async fn get_activity_by_task(
        &self,
        task_id: &str,
    ) -> Result<Vec<AiActivityRecord>, DataError> {
        let rows = sqlx::query(
            "SELECT * FROM ai_activity_records WHERE task_id = $1 ORDER BY timestamp",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(activity_from_row).collect())
    }

    async fn token_totals_by_task(&self, task_id: &str) -> Result<TokenUsage, DataError> {
        // SUM(BIGINT) comes back as NUMERIC; cast so the columns decode
        // as i64 like everywhere else.
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(input_tokens), 0)::BIGINT AS input_tokens,
                COALESCE(SUM(output_tokens), 0)::BIGINT AS output_tokens,
                COALESCE(SUM(cache_read_tokens), 0)::BIGINT AS cache_read_tokens,
                COALESCE(SUM(cache_creation_tokens), 0)::BIGINT AS cache_creation_tokens
            FROM ai_activity_records
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(tokens_from_row(&row))
    }
}
