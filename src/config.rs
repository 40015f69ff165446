//! Engine configuration.
//!
//! This module provides configuration options for the pipeline engine:
//! container settings, storage, transcript watching, queue concurrency,
//! and workflow timeouts.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the pipeline engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Container settings
    /// Image used for run containers.
    pub container_image: String,
    /// Workspace path inside the container the worktree is mounted at.
    pub workspace_path: String,
    /// Command the run container executes (the run worker).
    pub run_worker_command: Vec<String>,
    /// When true, agent processes are wrapped with `docker exec` into the
    /// run container; when false they run directly against the worktree.
    pub exec_in_container: bool,
    /// Grace period when stopping a run container.
    pub container_stop_timeout: Duration,

    // Storage settings
    /// PostgreSQL database connection URL.
    pub database_url: String,

    // Transcript settings
    /// Directory the agent's transcripts are tailed from.
    pub transcript_dir: PathBuf,
    /// Transcript directory poll cadence.
    pub transcript_poll_interval: Duration,

    // Queue settings
    /// Concurrency of the orchestrator worker.
    pub orchestrator_concurrency: usize,
    /// Concurrency of each run worker.
    pub run_worker_concurrency: usize,

    // Workflow timeouts
    /// Execution timeout for the setup workflow.
    pub setup_timeout: Duration,
    /// Execution timeout for each processing step workflow.
    pub step_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            container_image: "pipeforge-agent:latest".to_string(),
            workspace_path: "/workspace".to_string(),
            run_worker_command: vec!["pipeforge".to_string(), "run-worker".to_string()],
            exec_in_container: false,
            container_stop_timeout: Duration::from_secs(10),

            database_url: "postgres://localhost/pipeforge".to_string(),

            transcript_dir: PathBuf::from("/root/.claude/projects"),
            transcript_poll_interval: Duration::from_millis(100),

            orchestrator_concurrency: 16,
            run_worker_concurrency: 4,

            setup_timeout: Duration::from_secs(600),
            step_timeout: Duration::from_secs(1800),
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PIPEFORGE_CONTAINER_IMAGE`: run container image
    /// - `PIPEFORGE_WORKSPACE_PATH`: in-container workspace path
    /// - `PIPEFORGE_EXEC_IN_CONTAINER`: wrap agents with `docker exec`
    /// - `PIPEFORGE_CONTAINER_STOP_TIMEOUT_SECS`: container stop grace
    /// - `DATABASE_URL`: PostgreSQL connection URL
    /// - `PIPEFORGE_TRANSCRIPT_DIR`: transcript directory
    /// - `PIPEFORGE_TRANSCRIPT_POLL_MS`: transcript poll cadence
    /// - `PIPEFORGE_ORCHESTRATOR_CONCURRENCY`: orchestrator worker slots
    /// - `PIPEFORGE_RUN_WORKER_CONCURRENCY`: run worker slots
    /// - `PIPEFORGE_SETUP_TIMEOUT_SECS`: setup workflow timeout
    /// - `PIPEFORGE_STEP_TIMEOUT_SECS`: step workflow timeout
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PIPEFORGE_CONTAINER_IMAGE") {
            config.container_image = val;
        }
        if let Ok(val) = std::env::var("PIPEFORGE_WORKSPACE_PATH") {
            config.workspace_path = val;
        }
        if let Ok(val) = std::env::var("PIPEFORGE_EXEC_IN_CONTAINER") {
            config.exec_in_container = parse_env_value(&val, "PIPEFORGE_EXEC_IN_CONTAINER")?;
        }
        if let Ok(val) = std::env::var("PIPEFORGE_CONTAINER_STOP_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PIPEFORGE_CONTAINER_STOP_TIMEOUT_SECS")?;
            config.container_stop_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("DATABASE_URL") {
            config.database_url = val;
        }
        if let Ok(val) = std::env::var("PIPEFORGE_TRANSCRIPT_DIR") {
            config.transcript_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("PIPEFORGE_TRANSCRIPT_POLL_MS") {
            let ms: u64 = parse_env_value(&val, "PIPEFORGE_TRANSCRIPT_POLL_MS")?;
            config.transcript_poll_interval = Duration::from_millis(ms);
        }
        if let Ok(val) = std::env::var("PIPEFORGE_ORCHESTRATOR_CONCURRENCY") {
            config.orchestrator_concurrency =
                parse_env_value(&val, "PIPEFORGE_ORCHESTRATOR_CONCURRENCY")?;
        }
        if let Ok(val) = std::env::var("PIPEFORGE_RUN_WORKER_CONCURRENCY") {
            config.run_worker_concurrency =
                parse_env_value(&val, "PIPEFORGE_RUN_WORKER_CONCURRENCY")?;
        }
        if let Ok(val) = std::env::var("PIPEFORGE_SETUP_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PIPEFORGE_SETUP_TIMEOUT_SECS")?;
            config.setup_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("PIPEFORGE_STEP_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PIPEFORGE_STEP_TIMEOUT_SECS")?;
            config.step_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.container_image.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "container image must not be empty".to_string(),
            ));
        }
        if !self.workspace_path.starts_with('/') {
            return Err(ConfigError::ValidationFailed(
                "workspace path must be absolute".to_string(),
            ));
        }
        if self.orchestrator_concurrency == 0 || self.run_worker_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker concurrency must be at least 1".to_string(),
            ));
        }
        if self.setup_timeout.is_zero() || self.step_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "workflow timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
