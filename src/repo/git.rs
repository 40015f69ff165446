//! Repository service backed by the `git` CLI.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Output;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::RepoError;

use super::{DiffSummary, RepositoryService};

/// Default timeout for git operations.
const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Allowlist for branch names and commit identifiers.
fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/-]{0,254}$").unwrap())
}

/// Repository service shelling out to the system `git`.
///
/// Mutations take an advisory lock keyed by the target path so writes to
/// one repository or worktree are serialised; reads do not lock.
pub struct GitRepository {
    timeout: Duration,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl GitRepository {
    /// Creates a repository service with the default operation timeout.
    pub fn new() -> Self {
        Self::with_timeout(GIT_TIMEOUT)
    }

    /// Creates a repository service with an explicit operation timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    async fn run_git(&self, cwd: &Path, args: &[&str]) -> Result<Output, RepoError> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(cwd).args(args);
        debug!(cwd = %cwd.display(), args = ?args, "running git");

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(RepoError::Io(err)),
            Err(_) => Err(RepoError::Timeout(self.timeout)),
        }
    }

    async fn run_git_checked(&self, cwd: &Path, args: &[&str]) -> Result<String, RepoError> {
        let output = self.run_git(cwd, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RepoError::CommandFailed(format!(
                "git {}: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for GitRepository {
    fn default() -> Self {
        Self::new()
    }
}

/// Validates a branch name or commit identifier against the allowlist.
fn validate_identifier(ident: &str) -> Result<(), RepoError> {
    if identifier_pattern().is_match(ident) && !ident.contains("..") {
        Ok(())
    } else {
        Err(RepoError::InvalidIdentifier(ident.to_string()))
    }
}

/// Validates a filesystem path: absolute, no parent-dir traversal.
fn validate_path(path: &Path) -> Result<(), RepoError> {
    if !path.is_absolute() {
        return Err(RepoError::InvalidPath {
            path: path.to_path_buf(),
            reason: "must be absolute".to_string(),
        });
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(RepoError::InvalidPath {
            path: path.to_path_buf(),
            reason: "must not contain '..'".to_string(),
        });
    }
    Ok(())
}

/// Parses `git diff --numstat` output into (files, insertions, deletions).
fn parse_numstat(numstat: &str) -> (Vec<String>, u64, u64) {
    let mut files = Vec::new();
    let mut insertions = 0u64;
    let mut deletions = 0u64;

    for line in numstat.lines() {
        let mut parts = line.splitn(3, '\t');
        let ins = parts.next().unwrap_or("");
        let del = parts.next().unwrap_or("");
        let file = match parts.next() {
            Some(f) if !f.is_empty() => f,
            _ => continue,
        };
        // Binary files report "-" for both counters.
        insertions += ins.parse::<u64>().unwrap_or(0);
        deletions += del.parse::<u64>().unwrap_or(0);
        files.push(file.to_string());
    }

    (files, insertions, deletions)
}

#[async_trait]
impl RepositoryService for GitRepository {
    async fn create_worktree(
        &self,
        repo: &Path,
        base_commit: &str,
        branch: &str,
        dest: &Path,
    ) -> Result<(), RepoError> {
        validate_identifier(base_commit)?;
        validate_identifier(branch)?;
        validate_path(dest)?;

        let lock = self.lock_for(repo);
        let _guard = lock.lock().await;

        if dest.exists() {
            // Idempotent restart: accept an existing worktree already on
            // the requested branch.
            let head = self
                .run_git_checked(dest, &["rev-parse", "--abbrev-ref", "HEAD"])
                .await?;
            if head.trim() == branch {
                debug!(dest = %dest.display(), branch, "reusing existing worktree");
                return Ok(());
            }
            return Err(RepoError::InvalidPath {
                path: dest.to_path_buf(),
                reason: format!("exists but is on '{}', not '{}'", head.trim(), branch),
            });
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let dest_str = dest.to_string_lossy();
        self.run_git_checked(
            repo,
            &["worktree", "add", "-b", branch, dest_str.as_ref(), base_commit],
        )
        .await?;
        Ok(())
    }

    async fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), RepoError> {
        validate_path(path)?;

        let lock = self.lock_for(repo);
        let _guard = lock.lock().await;

        if !path.exists() {
            // Already gone; prune any stale registration.
            let _ = self.run_git(repo, &["worktree", "prune"]).await;
            return Ok(());
        }

        let path_str = path.to_string_lossy();
        let output = self
            .run_git(repo, &["worktree", "remove", "--force", path_str.as_ref()])
            .await?;
        if !output.status.success() {
            // Not a registered worktree (or half-removed): fall back to a
            // plain delete plus prune.
            warn!(
                path = %path.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "git worktree remove failed, deleting directory"
            );
            std::fs::remove_dir_all(path)?;
            let _ = self.run_git(repo, &["worktree", "prune"]).await;
        }
        Ok(())
    }

    async fn current_commit(&self, path: &Path) -> Result<String, RepoError> {
        validate_path(path)?;
        let sha = self.run_git_checked(path, &["rev-parse", "HEAD"]).await?;
        Ok(sha.trim().to_string())
    }

    async fn diff(&self, path: &Path) -> Result<DiffSummary, RepoError> {
        validate_path(path)?;

        let lock = self.lock_for(path);
        let _guard = lock.lock().await;

        // Stage everything so newly created files show up against HEAD.
        self.run_git_checked(path, &["add", "-A"]).await?;

        let raw = self.run_git_checked(path, &["diff", "HEAD"]).await?;
        let stat = self.run_git_checked(path, &["diff", "HEAD", "--stat"]).await?;
        let numstat = self
            .run_git_checked(path, &["diff", "HEAD", "--numstat"])
            .await?;

        let (files, insertions, deletions) = parse_numstat(&numstat);
        let has_changes = !files.is_empty();

        Ok(DiffSummary {
            raw,
            stat,
            files,
            insertions,
            deletions,
            has_changes,
        })
    }

    async fn commit(
        &self,
        path: &Path,
        files: &[String],
        message: &str,
    ) -> Result<String, RepoError> {
        validate_path(path)?;
        if files.is_empty() {
            return Err(RepoError::NothingToCommit(path.to_path_buf()));
        }

        let lock = self.lock_for(path);
        let _guard = lock.lock().await;

        let mut add_args: Vec<&str> = vec!["add", "--"];
        add_args.extend(files.iter().map(String::as_str));
        self.run_git_checked(path, &add_args).await?;

        let mut commit_args: Vec<&str> = vec!["commit", "-m", message, "--"];
        commit_args.extend(files.iter().map(String::as_str));
        let output = self.run_git(path, &commit_args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            if stdout.contains("nothing to commit") || stderr.contains("nothing to commit") {
                return Err(RepoError::NothingToCommit(path.to_path_buf()));
            }
            return Err(RepoError::CommandFailed(format!(
                "git commit: {} {}",
                stdout.trim(),
                stderr.trim()
            )));
        }

        self.current_commit(path).await
    }
}
