//! Agent subprocess execution.
//!
//! The `LocalExecute` activity runs on the run-scoped queue: it spawns the
//! rendered agent argv with the workspace as its working directory,
//! streams stdout/stderr through a bounded collector, heartbeats while
//! the process runs, and kills the process when the activity context is
//! cancelled.

mod collector;

pub use collector::OutputCollector;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ExecError;
use crate::runtime::ActivityContext;

/// Heartbeat cadence while the subprocess runs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// How often stale partial lines are flushed into the collector.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Grace period for the process to die after a kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// A request to execute an agent subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Rendered argv; `argv[0]` is the executable.
    pub argv: Vec<String>,
    /// Working directory for the process (the step's workspace).
    pub workspace: PathBuf,
    /// Optional wrapper prepended to the argv (e.g. a `docker exec`
    /// prefix when the engine runs outside the container).
    #[serde(default)]
    pub command_prefix: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl ExecuteRequest {
    /// Creates a request for the given argv and workspace.
    pub fn new(argv: Vec<String>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            argv,
            workspace: workspace.into(),
            command_prefix: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Sets the command prefix.
    pub fn with_prefix(mut self, prefix: Vec<String>) -> Self {
        self.command_prefix = prefix;
        self
    }

    /// Effective argv with the prefix applied.
    fn full_argv(&self) -> Vec<String> {
        let mut argv = self.command_prefix.clone();
        argv.extend(self.argv.iter().cloned());
        argv
    }
}

/// Outcome of an agent subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResult {
    /// Process exit code (-1 when terminated by signal).
    pub exit_code: i32,
    /// Captured stdout (bounded; see `stdout_truncated`).
    pub stdout: String,
    /// Captured stderr (bounded).
    pub stderr: String,
    /// Wall-clock duration.
    pub duration: Duration,
    /// `exit_code == 0`.
    pub success: bool,
    /// True when stdout hit the collection cap.
    pub stdout_truncated: bool,
    /// True when stderr hit the collection cap.
    pub stderr_truncated: bool,
}

async fn pump<R>(mut reader: R, collector: Arc<Mutex<OutputCollector>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                collector
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push_chunk(&chunk);
            }
            Err(err) => {
                warn!(error = %err, "output stream read failed");
                break;
            }
        }
    }
    collector
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .flush_partial();
}

/// Executes an agent subprocess to completion.
///
/// Cancellation of the activity context kills the process and waits up to
/// two seconds for it to die before returning [`ExecError::Cancelled`].
pub async fn local_execute(
    request: ExecuteRequest,
    ctx: ActivityContext,
) -> Result<ExecuteResult, ExecError> {
    let argv = request.full_argv();
    let Some((program, args)) = argv.split_first() else {
        return Err(ExecError::EmptyArgv);
    };

    let started = Instant::now();
    info!(
        command = %program,
        workspace = %request.workspace.display(),
        "spawning agent process"
    );

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&request.workspace)
        .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| ExecError::SpawnFailed {
        command: program.clone(),
        reason: e.to_string(),
    })?;

    let stdout_col = Arc::new(Mutex::new(OutputCollector::new()));
    let stderr_col = Arc::new(Mutex::new(OutputCollector::new()));

    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(pump(out, Arc::clone(&stdout_col))));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(pump(err, Arc::clone(&stderr_col))));

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately
    let mut flush = tokio::time::interval(FLUSH_INTERVAL);

    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            _ = flush.tick() => {
                stdout_col.lock().unwrap_or_else(|e| e.into_inner()).flush_stale();
                stderr_col.lock().unwrap_or_else(|e| e.into_inner()).flush_stale();
            }
            _ = heartbeat.tick() => {
                let (lines, truncated, tail) = {
                    let col = stdout_col.lock().unwrap_or_else(|e| e.into_inner());
                    (col.line_count(), col.is_truncated(), col.tail())
                };
                ctx.heartbeat.record(format!(
                    "phase=running elapsed_s={} lines={} truncated={} tail={}",
                    started.elapsed().as_secs(),
                    lines,
                    truncated,
                    tail.chars().take(512).collect::<String>(),
                ));
            }
            _ = ctx.cancel.cancelled() => {
                warn!(command = %program, "cancellation requested, killing agent process");
                let _ = child.start_kill();
                let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
                return Err(ExecError::Cancelled);
            }
        }
    };

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let (stdout, stdout_truncated) = {
        let mut col = stdout_col.lock().unwrap_or_else(|e| e.into_inner());
        col.flush_partial();
        (col.contents().to_string(), col.is_truncated())
    };
    let (stderr, stderr_truncated) = {
        let mut col = stderr_col.lock().unwrap_or_else(|e| e.into_inner());
        col.flush_partial();
        (col.contents().to_string(), col.is_truncated())
    };

    let exit_code = status.code().unwrap_or(-1);
    let duration = started.elapsed();
    let success = status.success();

    debug!(
        command = %program,
        exit_code,
        duration_ms = duration.as_millis() as u64,
        "agent process finished"
    );

    Ok(ExecuteResult {
        exit_code,
        stdout,
        stderr,
        duration,
        success,
        stdout_truncated,
        stderr_truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{CancelToken, Heartbeat};

    fn test_ctx() -> (ActivityContext, CancelToken) {
        let cancel = CancelToken::new();
        (
            ActivityContext {
                cancel: cancel.child(),
                heartbeat: Heartbeat::new(),
                attempt: 1,
            },
            cancel,
        )
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_successful_command() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _cancel) = test_ctx();
        let request = ExecuteRequest::new(sh("echo hello"), dir.path());

        let result = local_execute(request, ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hello");
        assert!(!result.stdout_truncated);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _cancel) = test_ctx();
        let request = ExecuteRequest::new(sh("echo oops >&2; exit 2"), dir.path());

        let result = local_execute(request, ctx).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _cancel) = test_ctx();
        let request = ExecuteRequest::new(sh("pwd"), dir.path());

        let result = local_execute(request, ctx).await.unwrap();
        let reported = PathBuf::from(result.stdout.trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _cancel) = test_ctx();
        let request = ExecuteRequest::new(
            vec!["definitely-not-a-real-binary-42".to_string()],
            dir.path(),
        );

        assert!(matches!(
            local_execute(request, ctx).await,
            Err(ExecError::SpawnFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_argv() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _cancel) = test_ctx();
        let request = ExecuteRequest::new(Vec::new(), dir.path());

        assert!(matches!(
            local_execute(request, ctx).await,
            Err(ExecError::EmptyArgv)
        ));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, cancel) = test_ctx();
        let request = ExecuteRequest::new(sh("sleep 60"), dir.path());

        let handle = tokio::spawn(local_execute(request, ctx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let started = Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("cancel must settle within 5s")
            .unwrap();
        assert!(matches!(result, Err(ExecError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_command_prefix_wraps_argv() {
        let request = ExecuteRequest::new(vec!["claude".to_string()], "/tmp")
            .with_prefix(vec!["docker".to_string(), "exec".to_string(), "c1".to_string()]);
        assert_eq!(request.full_argv(), vec!["docker", "exec", "c1", "claude"]);
    }
}
