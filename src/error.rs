//! Error types for the engine's service boundaries.
//!
//! Subsystems with their own module-level state (storage, bus, transcript
//! adapters, workflows) define their errors next to that state; the
//! service contracts shared across workflows live here:
//! - Repository operations (worktrees, diffs, commits)
//! - Container lifecycle management
//! - Agent subprocess execution

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from the repository service.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("git command failed: {0}")]
    CommandFailed(String),

    #[error("git operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("invalid git identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("no changes to commit in {0}")]
    NothingToCommit(PathBuf),

    #[error("worktree not found at {0}")]
    WorktreeNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the container service.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("container create failed: {0}")]
    CreateFailed(String),

    #[error("container '{id}' not found")]
    NotFound { id: String },

    #[error("container operation '{op}' failed: {reason}")]
    OperationFailed { op: String, reason: String },

    #[error("failed to write file into container: {0}")]
    WriteFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from agent subprocess execution.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("empty argv")]
    EmptyArgv,

    #[error("failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("execution cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_error_display() {
        let err = RepoError::InvalidIdentifier("--evil".to_string());
        assert!(err.to_string().contains("--evil"));

        let err = RepoError::NothingToCommit(PathBuf::from("/tmp/wt"));
        assert!(err.to_string().contains("/tmp/wt"));
    }

    #[test]
    fn test_container_error_display() {
        let err = ContainerError::NotFound { id: "abc".to_string() };
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn test_exec_error_display() {
        let err = ExecError::SpawnFailed {
            command: "claude".to_string(),
            reason: "not found".to_string(),
        };
        assert!(err.to_string().contains("claude"));
        assert!(err.to_string().contains("not found"));
    }
}
