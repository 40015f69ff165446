//! End-to-end engine scenarios over fake repository and container
//! services, the in-memory store, and real agent subprocesses (`sh -c`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use pipeforge::config::EngineConfig;
use pipeforge::container::{ContainerService, ContainerSpec};
use pipeforge::error::{ContainerError, RepoError};
use pipeforge::model::{AgentConfig, Project, RunStatus, StepDefinition, StepStatus};
use pipeforge::repo::{DiffSummary, RepositoryService};
use pipeforge::storage::{DataService, MemoryStore};
use pipeforge::transcript::{
    AdapterRegistry, AdapterError, ParsedRecord, RawEntry, ToolAdapter,
};
use pipeforge::workflows::WorkflowError;
use pipeforge::{PipelineEngine, StartPipelineCommand};

// ---------------------------------------------------------------------------
// Fake repository service: an in-memory commit graph whose worktrees are
// real directories, so agent subprocesses can write files into them.

#[derive(Debug, Clone)]
struct FakeCommit {
    parent: Option<String>,
    files: HashMap<String, String>,
}

#[derive(Debug)]
struct FakeRepoInner {
    head: HashMap<PathBuf, String>,
    commits: HashMap<String, FakeCommit>,
    worktree_heads: HashMap<PathBuf, (PathBuf, String)>,
    removed_worktrees: Vec<PathBuf>,
    created_worktrees: usize,
    next_sha: u64,
}

struct FakeRepo {
    inner: Mutex<FakeRepoInner>,
}

impl FakeRepo {
    fn new() -> Self {
        Self {
            inner: Mutex::new(FakeRepoInner {
                head: HashMap::new(),
                commits: HashMap::new(),
                worktree_heads: HashMap::new(),
                removed_worktrees: Vec::new(),
                created_worktrees: 0,
                next_sha: 0,
            }),
        }
    }

    /// Seeds a repository at `path` with an empty root commit `c0`.
    fn init_repo(&self, path: &Path) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.commits.insert(
            "c0".to_string(),
            FakeCommit {
                parent: None,
                files: HashMap::new(),
            },
        );
        inner.head.insert(path.to_path_buf(), "c0".to_string());
        "c0".to_string()
    }

    fn commit_parent(&self, sha: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .commits
            .get(sha)
            .and_then(|c| c.parent.clone())
    }

    fn commit_files(&self, sha: &str) -> HashMap<String, String> {
        self.inner
            .lock()
            .unwrap()
            .commits
            .get(sha)
            .map(|c| c.files.clone())
            .unwrap_or_default()
    }

    fn created_worktrees(&self) -> usize {
        self.inner.lock().unwrap().created_worktrees
    }

    fn live_worktrees(&self) -> usize {
        self.inner.lock().unwrap().worktree_heads.len()
    }
}

fn read_dir_files(root: &Path) -> HashMap<String, String> {
    fn visit(dir: &Path, root: &Path, files: &mut HashMap<String, String>) {
        let Ok(entries) = std::fs::read_dir(dir) else { return };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.is_dir() {
                visit(&path, root, files);
            } else if let Ok(content) = std::fs::read_to_string(&path) {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().to_string();
                files.insert(rel, content);
            }
        }
    }
    let mut files = HashMap::new();
    visit(root, root, &mut files);
    files
}

fn line_count(text: &str) -> u64 {
    text.lines().count() as u64
}

#[async_trait]
impl RepositoryService for FakeRepo {
    async fn create_worktree(
        &self,
        repo: &Path,
        base_commit: &str,
        _branch: &str,
        dest: &Path,
    ) -> Result<(), RepoError> {
        std::fs::create_dir_all(dest)?;
        let files = self.commit_files(base_commit);
        for (rel, content) in &files {
            let path = dest.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, content)?;
        }
        let mut inner = self.inner.lock().unwrap();
        inner
            .worktree_heads
            .insert(dest.to_path_buf(), (repo.to_path_buf(), base_commit.to_string()));
        inner.created_worktrees += 1;
        Ok(())
    }

    async fn remove_worktree(&self, _repo: &Path, path: &Path) -> Result<(), RepoError> {
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.worktree_heads.remove(path);
        inner.removed_worktrees.push(path.to_path_buf());
        Ok(())
    }

    async fn current_commit(&self, path: &Path) -> Result<String, RepoError> {
        let inner = self.inner.lock().unwrap();
        if let Some((_, head)) = inner.worktree_heads.get(path) {
            return Ok(head.clone());
        }
        inner
            .head
            .get(path)
            .cloned()
            .ok_or_else(|| RepoError::WorktreeNotFound(path.to_path_buf()))
    }

    async fn diff(&self, path: &Path) -> Result<DiffSummary, RepoError> {
        let head = {
            let inner = self.inner.lock().unwrap();
            inner
                .worktree_heads
                .get(path)
                .map(|(_, head)| head.clone())
                .ok_or_else(|| RepoError::WorktreeNotFound(path.to_path_buf()))?
        };
        let old = self.commit_files(&head);
        let new = read_dir_files(path);

        let mut files = Vec::new();
        let mut insertions = 0;
        let mut deletions = 0;
        for (rel, content) in &new {
            match old.get(rel) {
                None => {
                    files.push(rel.clone());
                    insertions += line_count(content);
                }
                Some(old_content) if old_content != content => {
                    files.push(rel.clone());
                    insertions += line_count(content).saturating_sub(line_count(old_content));
                    deletions += line_count(old_content).saturating_sub(line_count(content));
                }
                Some(_) => {}
            }
        }
        for (rel, old_content) in &old {
            if !new.contains_key(rel) {
                files.push(rel.clone());
                deletions += line_count(old_content);
            }
        }
        files.sort();

        let has_changes = !files.is_empty();
        Ok(DiffSummary {
            raw: format!("changed: {}", files.join(", ")),
            stat: format!("{} files changed", files.len()),
            files,
            insertions,
            deletions,
            has_changes,
        })
    }

    async fn commit(
        &self,
        path: &Path,
        _files: &[String],
        _message: &str,
    ) -> Result<String, RepoError> {
        let snapshot = read_dir_files(path);
        let mut inner = self.inner.lock().unwrap();
        let (_, head) = inner
            .worktree_heads
            .get(path)
            .cloned()
            .ok_or_else(|| RepoError::WorktreeNotFound(path.to_path_buf()))?;

        inner.next_sha += 1;
        let sha = format!("sha-{}", inner.next_sha);
        inner.commits.insert(
            sha.clone(),
            FakeCommit {
                parent: Some(head),
                files: snapshot,
            },
        );
        if let Some(entry) = inner.worktree_heads.get_mut(path) {
            entry.1 = sha.clone();
        }
        Ok(sha)
    }
}

// ---------------------------------------------------------------------------
// Fake container service.

#[derive(Debug, Default, Clone)]
struct FakeContainer {
    labels: HashMap<String, String>,
    running: bool,
    deleted: bool,
}

#[derive(Default)]
struct FakeContainers {
    inner: Mutex<HashMap<String, FakeContainer>>,
    next_id: Mutex<u64>,
}

impl FakeContainers {
    fn new() -> Self {
        Self::default()
    }

    fn alive_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.running && !c.deleted)
            .count()
    }

    fn undeleted_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|c| !c.deleted)
            .count()
    }
}

#[async_trait]
impl ContainerService for FakeContainers {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let existing = self.list_by_labels(&spec.labels).await?;
        if let Some(id) = existing.into_iter().next() {
            return Ok(id);
        }
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        let id = format!("ctr-{}", next);
        self.inner.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                labels: spec.labels.clone(),
                running: false,
                deleted: false,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), ContainerError> {
        let mut inner = self.inner.lock().unwrap();
        let container = inner
            .get_mut(id)
            .ok_or_else(|| ContainerError::NotFound { id: id.to_string() })?;
        container.running = true;
        Ok(())
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<(), ContainerError> {
        if let Some(container) = self.inner.lock().unwrap().get_mut(id) {
            container.running = false;
        }
        Ok(())
    }

    async fn delete(&self, id: &str, _force: bool) -> Result<(), ContainerError> {
        if let Some(container) = self.inner.lock().unwrap().get_mut(id) {
            container.running = false;
            container.deleted = true;
        }
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<(), ContainerError> {
        self.stop(id, Duration::ZERO).await
    }

    async fn write_file(
        &self,
        _id: &str,
        _path: &Path,
        _content: &[u8],
    ) -> Result<(), ContainerError> {
        Ok(())
    }

    async fn list_by_labels(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<String>, ContainerError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| {
                !c.deleted && labels.iter().all(|(k, v)| c.labels.get(k) == Some(v))
            })
            .map(|(id, _)| id.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Shell adapter: the prompt is the script.

struct ShAdapter;

impl ToolAdapter for ShAdapter {
    fn source(&self) -> &'static str {
        "sh"
    }

    fn parse_entry(&self, entry: &RawEntry) -> Result<Vec<ParsedRecord>, AdapterError> {
        let value: serde_json::Value =
            serde_json::from_str(&entry.data).map_err(|e| AdapterError::Malformed {
                line: entry.line_number,
                reason: e.to_string(),
            })?;
        Ok(vec![ParsedRecord {
            event_type: "text".to_string(),
            content_preview: value.get("text").and_then(|v| v.as_str()).map(String::from),
            ..Default::default()
        }])
    }

    fn render_argv(&self, _config: &AgentConfig, prompt: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), prompt.to_string()]
    }
}

// ---------------------------------------------------------------------------
// Harness.

struct Harness {
    engine: PipelineEngine,
    repo: Arc<FakeRepo>,
    containers: Arc<FakeContainers>,
    data: Arc<MemoryStore>,
    _repo_dir: tempfile::TempDir,
    transcript_dir: tempfile::TempDir,
    events: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    async fn new() -> Self {
        let repo = Arc::new(FakeRepo::new());
        let containers = Arc::new(FakeContainers::new());
        let data = Arc::new(MemoryStore::new());
        let repo_dir = tempfile::tempdir().unwrap();
        let transcript_dir = tempfile::tempdir().unwrap();

        repo.init_repo(repo_dir.path());

        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(ShAdapter));

        let config = EngineConfig {
            transcript_dir: transcript_dir.path().to_path_buf(),
            transcript_poll_interval: Duration::from_millis(20),
            setup_timeout: Duration::from_secs(30),
            step_timeout: Duration::from_secs(60),
            ..Default::default()
        };

        let engine = PipelineEngine::new(
            Arc::clone(&repo) as Arc<dyn RepositoryService>,
            Arc::clone(&containers) as Arc<dyn ContainerService>,
            Arc::clone(&data) as Arc<dyn DataService>,
            Arc::new(adapters),
            config,
        );

        let project = Project::new("proj", "Project", repo_dir.path());
        engine.register_project(&project).await.unwrap();

        // Collect event kinds in arrival order (AI activity excluded).
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut rx = engine.subscribe();
        let sink = Arc::clone(&events);
        tokio::spawn(async move {
            while let Ok(envelope) = rx.recv().await {
                let kind = envelope.event.kind().to_string();
                if kind != "ai-activity" {
                    sink.lock().unwrap().push(kind);
                }
            }
        });

        Self {
            engine,
            repo,
            containers,
            data,
            _repo_dir: repo_dir,
            transcript_dir,
            events,
        }
    }

    fn sh_step(&self, id: &str, script: &str) -> StepDefinition {
        StepDefinition::new(id, format!("Step {}", id))
            .with_agent(AgentConfig::new("sh", script))
    }

    /// Event kinds observed so far, after letting the subscriber drain.
    async fn event_kinds(&self) -> Vec<String> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.events.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Scenarios.

#[tokio::test]
async fn happy_single_step() {
    let h = Harness::new().await;
    let cmd = StartPipelineCommand::new(
        "proj",
        "pl",
        "single",
        vec![h.sh_step("write-a", "echo x > a.txt")],
    );

    let started = h.engine.start_pipeline(cmd).await.unwrap();
    assert!(!started.already_exists);
    let outcome = h.engine.wait(&started.run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.step_results.len(), 1);

    let step = &outcome.step_results[0];
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.files_changed, vec!["a.txt"]);
    assert_eq!(step.insertions, 1);
    assert_eq!(step.deletions, 0);

    let commit = step.commit_sha.clone().unwrap();
    assert_eq!(h.repo.commit_parent(&commit).as_deref(), Some("c0"));
    assert_eq!(outcome.head_commit_sha.as_deref(), Some(commit.as_str()));

    let kinds = h.event_kinds().await;
    assert_eq!(
        kinds,
        vec![
            "pipeline-created",
            "step-started",
            "step-completed",
            "pipeline-finished"
        ]
    );

    // The run row carries the final state.
    let run = h.data.get_pipeline_run(&started.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.head_commit_sha.as_deref(), Some(commit.as_str()));
}

#[tokio::test]
async fn two_steps_chain_commits() {
    let h = Harness::new().await;
    let cmd = StartPipelineCommand::new(
        "proj",
        "pl",
        "chain",
        vec![
            h.sh_step("s1", "echo x > a"),
            h.sh_step("s2", "echo y > b"),
        ],
    );

    let started = h.engine.start_pipeline(cmd).await.unwrap();
    let outcome = h.engine.wait(&started.run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    let first = outcome.step_results[0].commit_sha.clone().unwrap();
    let second = outcome.step_results[1].commit_sha.clone().unwrap();

    assert_eq!(h.repo.commit_parent(&first).as_deref(), Some("c0"));
    assert_eq!(h.repo.commit_parent(&second).as_deref(), Some(first.as_str()));
    assert_eq!(outcome.head_commit_sha.as_deref(), Some(second.as_str()));

    // Step 2's snapshot contains both files.
    let files = h.repo.commit_files(&second);
    assert_eq!(files.get("a").map(String::as_str), Some("x\n"));
    assert_eq!(files.get("b").map(String::as_str), Some("y\n"));
}

#[tokio::test]
async fn agent_failure_fails_run_and_cleans_up() {
    let h = Harness::new().await;
    let cmd = StartPipelineCommand::new(
        "proj",
        "pl",
        "failing",
        vec![h.sh_step("boom", "echo broken >&2; exit 2")],
    );

    let started = h.engine.start_pipeline(cmd).await.unwrap();
    let err = h.engine.wait(&started.run_id).await.unwrap_err();
    assert!(matches!(err, WorkflowError::StepFailed { .. }));

    // Run row retained, marked failed.
    let run = h.data.get_pipeline_run(&started.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    // Step result retained with the exit code.
    let steps = h.data.list_step_results(&started.run_id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Failed);
    let reason = steps[0].error_message.clone().unwrap();
    assert!(reason.contains("code 2"), "unexpected reason: {}", reason);
    assert!(reason.contains("broken"));

    // Compensations removed the worktree and the container.
    assert_eq!(h.repo.live_worktrees(), 0);
    assert_eq!(h.containers.undeleted_count(), 0);

    let kinds = h.event_kinds().await;
    assert!(kinds.contains(&"step-failed".to_string()));
    assert_eq!(kinds.last().map(String::as_str), Some("pipeline-failed"));
    assert!(!kinds.contains(&"pipeline-finished".to_string()));
}

#[tokio::test]
async fn replay_same_run_id() {
    let h = Harness::new().await;
    let mut cmd = StartPipelineCommand::new(
        "proj",
        "pl",
        "replayed",
        vec![h.sh_step("write-a", "echo x > a.txt")],
    );
    cmd.run_id = Some("run-fixed".to_string());

    let first = h.engine.start_pipeline(cmd.clone()).await.unwrap();
    assert!(!first.already_exists);
    let outcome = h.engine.wait(&first.run_id).await.unwrap();
    let worktrees_after_first = h.repo.created_worktrees();

    let second = h.engine.start_pipeline(cmd).await.unwrap();
    assert_eq!(second.run_id, "run-fixed");
    assert!(second.already_exists);

    // No new worktree or container.
    assert_eq!(h.repo.created_worktrees(), worktrees_after_first);

    // Step results unchanged.
    let steps = h.data.list_step_results("run-fixed").await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(
        steps[0].commit_sha,
        outcome.step_results[0].commit_sha
    );
}

#[tokio::test]
async fn same_run_id_different_pipeline_is_rejected() {
    let h = Harness::new().await;
    let mut cmd = StartPipelineCommand::new(
        "proj",
        "pl",
        "original",
        vec![h.sh_step("write-a", "echo x > a.txt")],
    );
    cmd.run_id = Some("run-conflict".to_string());

    let started = h.engine.start_pipeline(cmd.clone()).await.unwrap();
    h.engine.wait(&started.run_id).await.unwrap();

    cmd.steps = vec![h.sh_step("write-a", "echo CHANGED > a.txt")];
    let err = h.engine.start_pipeline(cmd).await.unwrap_err();
    assert!(matches!(err, WorkflowError::IdentityMismatch { .. }));
}

#[tokio::test]
async fn fork_reuses_matching_prefix() {
    let h = Harness::new().await;
    let parent_cmd = StartPipelineCommand::new(
        "proj",
        "pl",
        "parent",
        vec![
            h.sh_step("s1", "echo x > a"),
            h.sh_step("s2", "echo y > b"),
        ],
    );
    let parent = h.engine.start_pipeline(parent_cmd).await.unwrap();
    let parent_outcome = h.engine.wait(&parent.run_id).await.unwrap();
    let parent_s1_commit = parent_outcome.step_results[0].commit_sha.clone().unwrap();

    let mut child_cmd = StartPipelineCommand::new(
        "proj",
        "pl",
        "child",
        vec![
            h.sh_step("s1", "echo x > a"),
            h.sh_step("s2", "echo z > b"),
        ],
    );
    child_cmd.fork_from_run_id = Some(parent.run_id.clone());
    child_cmd.fork_after_step_id = Some("s1".to_string());

    let child = h.engine.start_pipeline(child_cmd).await.unwrap();
    let outcome = h.engine.wait(&child.run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.step_results[0].status, StepStatus::Skipped);
    assert_eq!(
        outcome.step_results[0].commit_sha.as_deref(),
        Some(parent_s1_commit.as_str())
    );
    assert_eq!(outcome.step_results[1].status, StepStatus::Completed);

    // The fresh step started from s1's commit: a untouched, b rewritten.
    let head = outcome.head_commit_sha.clone().unwrap();
    assert_eq!(
        h.repo.commit_parent(&head).as_deref(),
        Some(parent_s1_commit.as_str())
    );
    let files = h.repo.commit_files(&head);
    assert_eq!(files.get("a").map(String::as_str), Some("x\n"));
    assert_eq!(files.get("b").map(String::as_str), Some("z\n"));

    // Fork lineage recorded on the run.
    let run = h.data.get_pipeline_run(&child.run_id).await.unwrap().unwrap();
    assert_eq!(run.parent_run_id.as_deref(), Some(parent.run_id.as_str()));
    assert_eq!(run.fork_after_step_id.as_deref(), Some("s1"));
    assert_eq!(run.start_commit_sha.as_deref(), Some(parent_s1_commit.as_str()));
}

#[tokio::test]
async fn fork_with_changed_prefix_is_rejected() {
    let h = Harness::new().await;
    let parent_cmd = StartPipelineCommand::new(
        "proj",
        "pl",
        "parent",
        vec![h.sh_step("s1", "echo x > a"), h.sh_step("s2", "echo y > b")],
    );
    let parent = h.engine.start_pipeline(parent_cmd).await.unwrap();
    h.engine.wait(&parent.run_id).await.unwrap();

    let mut child_cmd = StartPipelineCommand::new(
        "proj",
        "pl",
        "child",
        vec![
            h.sh_step("s1", "echo DIFFERENT > a"),
            h.sh_step("s2", "echo z > b"),
        ],
    );
    child_cmd.fork_from_run_id = Some(parent.run_id.clone());
    child_cmd.fork_after_step_id = Some("s1".to_string());

    let child = h.engine.start_pipeline(child_cmd).await.unwrap();
    let err = h.engine.wait(&child.run_id).await.unwrap_err();
    assert!(matches!(err, WorkflowError::ForkValidation(_)));
}

#[tokio::test]
async fn auto_fork_kicks_in_for_shared_prefix() {
    let h = Harness::new().await;
    let parent_cmd = StartPipelineCommand::new(
        "proj",
        "pl",
        "parent",
        vec![h.sh_step("s1", "echo x > a"), h.sh_step("s2", "echo y > b")],
    );
    let parent = h.engine.start_pipeline(parent_cmd).await.unwrap();
    h.engine.wait(&parent.run_id).await.unwrap();

    // Same first step, changed second, no explicit fork directive.
    let child_cmd = StartPipelineCommand::new(
        "proj",
        "pl",
        "child",
        vec![h.sh_step("s1", "echo x > a"), h.sh_step("s2", "echo z > b")],
    );
    let child = h.engine.start_pipeline(child_cmd).await.unwrap();
    let outcome = h.engine.wait(&child.run_id).await.unwrap();

    assert_eq!(outcome.step_results[0].status, StepStatus::Skipped);
    let run = h.data.get_pipeline_run(&child.run_id).await.unwrap().unwrap();
    assert_eq!(run.parent_run_id.as_deref(), Some(parent.run_id.as_str()));
}

#[tokio::test]
async fn no_auto_fork_flag_disables_reuse() {
    let h = Harness::new().await;
    let parent_cmd = StartPipelineCommand::new(
        "proj",
        "pl",
        "parent",
        vec![h.sh_step("s1", "echo x > a"), h.sh_step("s2", "echo y > b")],
    );
    let parent = h.engine.start_pipeline(parent_cmd).await.unwrap();
    h.engine.wait(&parent.run_id).await.unwrap();

    let mut child_cmd = StartPipelineCommand::new(
        "proj",
        "pl",
        "child",
        vec![h.sh_step("s1", "echo x > a"), h.sh_step("s2", "echo z > b")],
    );
    child_cmd.no_auto_fork = true;
    let child = h.engine.start_pipeline(child_cmd).await.unwrap();
    let outcome = h.engine.wait(&child.run_id).await.unwrap();

    assert!(outcome
        .step_results
        .iter()
        .all(|s| s.status == StepStatus::Completed));
}

#[tokio::test]
async fn cancellation_kills_step_and_cleans_up() {
    let h = Harness::new().await;
    let cmd = StartPipelineCommand::new(
        "proj",
        "pl",
        "cancelme",
        vec![h.sh_step("sleepy", "sleep 60")],
    );

    let started = h.engine.start_pipeline(cmd).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(h.engine.cancel(&started.run_id, Some("test")));

    let start = std::time::Instant::now();
    let err = tokio::time::timeout(Duration::from_secs(10), h.engine.wait(&started.run_id))
        .await
        .expect("cancellation must settle")
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(5));

    let run = h.data.get_pipeline_run(&started.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some("Cancelled by user"));

    // No orphan container, no orphan worktree.
    assert_eq!(h.containers.alive_count(), 0);
    assert_eq!(h.repo.live_worktrees(), 0);
}

#[tokio::test]
async fn transcript_lines_become_activity_records() {
    let h = Harness::new().await;
    let cmd = StartPipelineCommand::new(
        "proj",
        "pl",
        "transcribed",
        vec![h.sh_step("slow", "sleep 1; echo done > out.txt")],
    );

    let started = h.engine.start_pipeline(cmd).await.unwrap();

    // Let the watcher attach, then write a transcript while the step runs.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let transcript = h
        .transcript_dir
        .path()
        .join(format!("{}.jsonl", uuid::Uuid::new_v4()));
    let lines = [
        r#"{"text":"thinking about it"}"#,
        r#"not even json"#,
        r#"{"text":"done"}"#,
    ];
    std::fs::write(&transcript, format!("{}\n", lines.join("\n"))).unwrap();

    h.engine.wait(&started.run_id).await.unwrap();

    let records = h.data.get_activity_by_run(&started.run_id).await.unwrap();
    for line in lines {
        assert!(
            records.iter().any(|r| r.raw_payload == line),
            "missing raw record for line: {}",
            line
        );
    }
    // Parsed lines got their event type; the malformed one stayed raw.
    assert!(records
        .iter()
        .any(|r| r.raw_payload == lines[0] && r.event_type == "text"));
    assert!(records
        .iter()
        .any(|r| r.raw_payload == lines[1] && r.event_type.is_empty()));

    // Records read during the step carry its task id.
    let task = pipeforge::model::task_id(&started.run_id, "slow");
    let by_task = h.data.get_activity_by_task(&task).await.unwrap();
    assert!(!by_task.is_empty());
}

#[tokio::test]
async fn run_without_steps_completes_at_base() {
    let h = Harness::new().await;
    let cmd = StartPipelineCommand::new("proj", "pl", "empty", vec![]);

    let started = h.engine.start_pipeline(cmd).await.unwrap();
    let outcome = h.engine.wait(&started.run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.step_results.is_empty());
    assert_eq!(outcome.head_commit_sha.as_deref(), Some("c0"));
}
