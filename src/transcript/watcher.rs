//! Transcript directory watcher.
//!
//! A blocking activity on the run-scoped queue that lives for the whole
//! pipeline: it polls the transcript directory, tails every UUID-named
//! `*.jsonl` file, and forwards each complete line as a
//! `raw-transcript-line` signal to the observability workflow. No parsing
//! happens here.
//!
//! The watcher is idempotent on restart: a restarted attempt re-discovers
//! files and may re-forward lines; the observability workflow's save path
//! deduplicates by event id derivation downstream.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::ExecError;
use crate::runtime::{ActivityContext, SignalSender};

/// Default directory poll cadence.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Directory the agent writes transcripts into.
    pub transcript_dir: PathBuf,
    /// Adapter tag stamped on every forwarded line.
    pub source: String,
    /// Owning run.
    pub run_id: String,
    /// Owning project.
    pub project_id: String,
    /// Poll cadence.
    pub poll_interval: Duration,
}

impl WatcherConfig {
    /// Creates a config with the default source and poll interval.
    pub fn new(
        transcript_dir: impl Into<PathBuf>,
        run_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            transcript_dir: transcript_dir.into(),
            source: "claude".to_string(),
            run_id: run_id.into(),
            project_id: project_id.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the adapter source tag.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Overrides the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Payload of a `raw-transcript-line` signal.
#[derive(Debug, Clone)]
pub struct RawLineSignal {
    /// Adapter tag.
    pub source: String,
    /// The transcript line, verbatim.
    pub raw_line: String,
    /// When the line was read.
    pub timestamp: DateTime<Utc>,
    /// Run-level task id.
    pub task_id: String,
    /// Owning project.
    pub project_id: String,
    /// Session id from the transcript file name.
    pub session_id: String,
    /// 1-based line number within the file.
    pub line_number: u64,
}

/// Tail state of one transcript file.
#[derive(Debug)]
struct TailState {
    offset: u64,
    line_number: u64,
    partial: String,
    session_id: String,
}

/// True for `*.jsonl` files whose basename is a UUID.
fn is_transcript_file(path: &Path) -> bool {
    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
        return false;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|stem| Uuid::parse_str(stem).is_ok())
        .unwrap_or(false)
}

/// Scans the transcript directory for watchable files.
fn discover(dir: &Path) -> Vec<PathBuf> {
    if !dir.exists() {
        return Vec::new();
    }
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| is_transcript_file(p))
        .collect()
}

/// Reads newly appended bytes of one file, forwarding complete lines.
/// Returns the number of lines forwarded.
fn drain_file(
    path: &Path,
    state: &mut TailState,
    config: &WatcherConfig,
    signals: &SignalSender<RawLineSignal>,
) -> std::io::Result<u64> {
    let len = std::fs::metadata(path)?.len();

    if len < state.offset {
        // Truncated or rotated in place: restart from the top.
        debug!(file = %path.display(), "transcript file shrank, restarting tail");
        state.offset = 0;
        state.line_number = 0;
        state.partial.clear();
    }
    if len == state.offset {
        return Ok(0);
    }

    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(state.offset))?;
    let mut buf = String::new();
    file.take(len - state.offset).read_to_string(&mut buf)?;
    state.offset = len;

    let mut forwarded = 0u64;
    let mut chunk = std::mem::take(&mut state.partial);
    chunk.push_str(&buf);

    let mut rest = chunk.as_str();
    while let Some(newline) = rest.find('\n') {
        let line = &rest[..newline];
        rest = &rest[newline + 1..];
        state.line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let signal = RawLineSignal {
            source: config.source.clone(),
            raw_line: line.to_string(),
            timestamp: Utc::now(),
            task_id: config.run_id.clone(),
            project_id: config.project_id.clone(),
            session_id: state.session_id.clone(),
            line_number: state.line_number,
        };
        if signals.send(signal).is_err() {
            // Observability workflow is gone; nothing left to forward to.
            return Ok(forwarded);
        }
        forwarded += 1;
    }
    // JSONL writers append whole lines; keep any trailing fragment until
    // its newline arrives.
    state.partial = rest.to_string();

    Ok(forwarded)
}

/// Runs the watcher until the activity context is cancelled. Returns the
/// total number of lines forwarded.
pub async fn watch_transcripts(
    config: WatcherConfig,
    ctx: ActivityContext,
    signals: SignalSender<RawLineSignal>,
) -> Result<u64, ExecError> {
    let mut states: HashMap<PathBuf, TailState> = HashMap::new();
    let mut forwarded = 0u64;
    let mut poll = tokio::time::interval(config.poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut initial_scan_done = false;

    debug!(
        dir = %config.transcript_dir.display(),
        source = %config.source,
        "transcript watcher started"
    );

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!(forwarded, "transcript watcher stopping");
                return Ok(forwarded);
            }
            _ = heartbeat.tick() => {
                ctx.heartbeat.record(format!(
                    "lines={} files={}",
                    forwarded,
                    states.len()
                ));
            }
            _ = poll.tick() => {
                for path in discover(&config.transcript_dir) {
                    if !states.contains_key(&path) {
                        let session_id = path
                            .file_stem()
                            .and_then(|s| s.to_str())
                            .unwrap_or("unknown")
                            .to_string();
                        // Files present before the watcher started hold
                        // history from other sessions: skip to EOF. Files
                        // appearing later are read from the beginning.
                        let offset = if initial_scan_done {
                            0
                        } else {
                            std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0)
                        };
                        debug!(file = %path.display(), offset, "tailing transcript file");
                        states.insert(path.clone(), TailState {
                            offset,
                            line_number: 0,
                            partial: String::new(),
                            session_id,
                        });
                    }
                }
                initial_scan_done = true;

                let mut vanished = Vec::new();
                for (path, state) in states.iter_mut() {
                    match drain_file(path, state, &config, &signals) {
                        Ok(count) => forwarded += count,
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                            vanished.push(path.clone());
                        }
                        Err(err) => {
                            warn!(file = %path.display(), error = %err, "transcript read failed");
                        }
                    }
                }
                for path in vanished {
                    debug!(file = %path.display(), "transcript file removed");
                    states.remove(&path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{signal_channel, CancelToken, Heartbeat};
    use std::io::Write;

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

    #[test]
    fn test_is_transcript_file() {
        let uuid = Uuid::new_v4();
        assert!(is_transcript_file(Path::new(&format!("/t/{}.jsonl", uuid))));
        assert!(!is_transcript_file(Path::new("/t/notes.jsonl")));
        assert!(!is_transcript_file(Path::new(&format!("/t/{}.json", uuid))));
    }

    #[tokio::test]
    async fn test_watcher_forwards_appended_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join(format!("{}.jsonl", Uuid::new_v4()));
        let (tx, mut rx) = signal_channel();
        let (ctx, cancel) = test_ctx();

        let config = WatcherConfig::new(dir.path(), "run-1", "proj")
            .with_poll_interval(Duration::from_millis(10));
        let handle = tokio::spawn(watch_transcripts(config, ctx, tx));

        // Give the watcher its initial scan, then create the file.
        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let mut file = std::fs::File::create(&file_path).unwrap();
            writeln!(file, r#"{{"type":"assistant","n":1}}"#).unwrap();
            writeln!(file, r#"{{"type":"assistant","n":2}}"#).unwrap();
        }

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(first.raw_line.contains("\"n\":1"));
        assert!(second.raw_line.contains("\"n\":2"));
        assert_eq!(first.line_number, 1);
        assert_eq!(second.line_number, 2);
        assert_eq!(first.task_id, "run-1");

        cancel.cancel();
        let forwarded = handle.await.unwrap().unwrap();
        assert_eq!(forwarded, 2);
    }

    #[tokio::test]
    async fn test_watcher_skips_preexisting_content() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join(format!("{}.jsonl", Uuid::new_v4()));
        std::fs::write(&file_path, "{\"old\":true}\n").unwrap();

        let (tx, mut rx) = signal_channel();
        let (ctx, cancel) = test_ctx();
        let config = WatcherConfig::new(dir.path(), "run-1", "proj")
            .with_poll_interval(Duration::from_millis(10));
        let handle = tokio::spawn(watch_transcripts(config, ctx, tx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&file_path)
                .unwrap();
            writeln!(file, "{{\"new\":true}}").unwrap();
        }

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(got.raw_line.contains("new"));

        cancel.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_watcher_holds_partial_lines() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join(format!("{}.jsonl", Uuid::new_v4()));
        let (tx, mut rx) = signal_channel();
        let (ctx, cancel) = test_ctx();
        let config = WatcherConfig::new(dir.path(), "run-1", "proj")
            .with_poll_interval(Duration::from_millis(10));
        let handle = tokio::spawn(watch_transcripts(config, ctx, tx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let mut file = std::fs::File::create(&file_path).unwrap();
            write!(file, "{{\"half\":").unwrap();
            file.flush().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_none());

        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&file_path)
                .unwrap();
            writeln!(file, "true}}").unwrap();
        }

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.raw_line, "{\"half\":true}");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
