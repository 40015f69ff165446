//! Database schema constants.
//!
//! This module contains all SQL schema definitions for the PostgreSQL
//! storage backend.

/// SQL schema for creating the projects table.
pub const CREATE_PROJECTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id VARCHAR(255) PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    repository_path VARCHAR(1024) NOT NULL
)
"#;

/// SQL schema for creating the pipeline_runs table.
pub const CREATE_PIPELINE_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id VARCHAR(255) PRIMARY KEY,
    pipeline_id VARCHAR(255) NOT NULL,
    project_id VARCHAR(255) NOT NULL,
    name VARCHAR(255) NOT NULL,
    status VARCHAR(32) NOT NULL,
    parent_run_id VARCHAR(255),
    fork_after_step_id VARCHAR(255),
    start_commit_sha VARCHAR(64),
    branch_name VARCHAR(255),
    base_commit_sha VARCHAR(64),
    head_commit_sha VARCHAR(64),
    prompt_prefix TEXT NOT NULL DEFAULT '',
    prompt_suffix TEXT NOT NULL DEFAULT '',
    identity_hash VARCHAR(64) NOT NULL,
    worktree_path VARCHAR(1024),
    container_id VARCHAR(128),
    workflow_id VARCHAR(255),
    error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ
)
"#;

/// SQL schema for creating the step_results table.
pub const CREATE_STEP_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS step_results (
    id VARCHAR(255) PRIMARY KEY,
    pipeline_run_id VARCHAR(255) NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
    step_id VARCHAR(255) NOT NULL,
    step_index INTEGER NOT NULL,
    status VARCHAR(32) NOT NULL,
    commit_sha VARCHAR(64),
    commit_message TEXT,
    git_diff TEXT,
    files_changed JSONB NOT NULL DEFAULT '[]',
    insertions BIGINT NOT NULL DEFAULT 0,
    deletions BIGINT NOT NULL DEFAULT 0,
    input_tokens BIGINT NOT NULL DEFAULT 0,
    output_tokens BIGINT NOT NULL DEFAULT 0,
    cache_read_tokens BIGINT NOT NULL DEFAULT 0,
    cache_creation_tokens BIGINT NOT NULL DEFAULT 0,
    agent_output TEXT,
    duration_ms BIGINT NOT NULL DEFAULT 0,
    error_message TEXT,
    definition_hash VARCHAR(64) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE(pipeline_run_id, step_index)
)
"#;

/// SQL schema for creating the ai_activity_records table.
pub const CREATE_AI_ACTIVITY_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ai_activity_records (
    event_id VARCHAR(255) PRIMARY KEY,
    task_id VARCHAR(255) NOT NULL,
    run_id VARCHAR(255) NOT NULL,
    step_id VARCHAR(255) NOT NULL DEFAULT '',
    project_id VARCHAR(255) NOT NULL,
    source VARCHAR(64) NOT NULL,
    event_type VARCHAR(64) NOT NULL DEFAULT '',
    timestamp TIMESTAMPTZ NOT NULL,
    tool_name VARCHAR(255),
    input_summary TEXT,
    content_preview TEXT,
    input_tokens BIGINT NOT NULL DEFAULT 0,
    output_tokens BIGINT NOT NULL DEFAULT 0,
    cache_read_tokens BIGINT NOT NULL DEFAULT 0,
    cache_creation_tokens BIGINT NOT NULL DEFAULT 0,
    raw_payload TEXT NOT NULL
)
"#;

/// SQL for creating the required indexes. One statement per entry: the
/// migration runner executes each through a prepared statement, which
/// only accepts a single command.
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_pipeline_runs_identity_hash ON pipeline_runs(identity_hash)",
    "CREATE INDEX IF NOT EXISTS idx_pipeline_runs_parent_run_id ON pipeline_runs(parent_run_id)",
    "CREATE INDEX IF NOT EXISTS idx_pipeline_runs_project_id ON pipeline_runs(project_id)",
    "CREATE INDEX IF NOT EXISTS idx_step_results_pipeline_run_id ON step_results(pipeline_run_id)",
    "CREATE INDEX IF NOT EXISTS idx_step_results_definition_hash ON step_results(definition_hash)",
    "CREATE INDEX IF NOT EXISTS idx_ai_activity_task_id ON ai_activity_records(task_id)",
    "CREATE INDEX IF NOT EXISTS idx_ai_activity_run_id ON ai_activity_records(run_id)",
    "CREATE INDEX IF NOT EXISTS idx_ai_activity_step_id ON ai_activity_records(step_id)",
];

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut statements = vec![
        CREATE_PROJECTS_TABLE,
        CREATE_PIPELINE_RUNS_TABLE,
        CREATE_STEP_RESULTS_TABLE,
        CREATE_AI_ACTIVITY_RECORDS_TABLE,
    ];
    statements.extend_from_slice(CREATE_INDEXES);
    statements
}

/// Table names in the schema.
pub mod tables {
    /// Pipeline runs table name.
    pub const PIPELINE_RUNS: &str = "pipeline_runs";
    /// Step results table name.
    pub const STEP_RESULTS: &str = "step_results";
    /// AI activity records table name.
    pub const AI_ACTIVITY_RECORDS: &str = "ai_activity_records";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 4 + CREATE_INDEXES.len());
        // Runs must come before step_results (which references it)
        assert!(statements[1].contains("pipeline_runs"));
        assert!(statements[2].contains("step_results"));
        // Indexes come last, one statement each
        for statement in &statements[4..] {
            assert!(statement.starts_with("CREATE INDEX"));
            assert!(!statement.contains(';'));
        }
    }

    #[test]
    fn test_table_constants() {
        assert_eq!(tables::PIPELINE_RUNS, "pipeline_runs");
        assert_eq!(tables::STEP_RESULTS, "step_results");
        assert_eq!(tables::AI_ACTIVITY_RECORDS, "ai_activity_records");
    }
}
