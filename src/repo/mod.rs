//! Repository service.
//!
//! All git access in the engine goes through this interface, and only from
//! orchestrator-queue activities: the container may not have credentials
//! or the full repository, and centralising mutations serialises writes
//! through one process.

mod git;

pub use git::GitRepository;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RepoError;

/// Diff of a worktree against its `HEAD`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffSummary {
    /// Full raw diff.
    pub raw: String,
    /// Human-readable stat block.
    pub stat: String,
    /// Paths with changes.
    pub files: Vec<String>,
    /// Inserted lines across all files.
    pub insertions: u64,
    /// Deleted lines across all files.
    pub deletions: u64,
    /// True when any file changed.
    pub has_changes: bool,
}

/// Git operations the engine consumes.
///
/// Implementations serialise writes per repository and per worktree;
/// readers may proceed concurrently. All mutations validate paths and
/// identifiers and enforce a per-operation timeout.
#[async_trait]
pub trait RepositoryService: Send + Sync {
    /// Creates a worktree at `dest` checked out at `base_commit` on a new
    /// branch. Idempotent: succeeds when `dest` already holds a worktree
    /// on `branch`.
    async fn create_worktree(
        &self,
        repo: &Path,
        base_commit: &str,
        branch: &str,
        dest: &Path,
    ) -> Result<(), RepoError>;

    /// Removes a worktree. Idempotent: an absent worktree is success.
    async fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), RepoError>;

    /// Resolves the current `HEAD` commit of a working tree.
    async fn current_commit(&self, path: &Path) -> Result<String, RepoError>;

    /// Captures the diff of the worktree against `HEAD`, including files
    /// the agent newly created.
    async fn diff(&self, path: &Path) -> Result<DiffSummary, RepoError>;

    /// Commits only the listed paths with the given message and returns
    /// the new commit SHA. Fails when none of the paths have changes.
    async fn commit(
        &self,
        path: &Path,
        files: &[String],
        message: &str,
    ) -> Result<String, RepoError>;
}
