//! AI observability workflow: one per run, alive for the pipeline's
//! lifetime.
//!
//! Consumes two signals: `raw-transcript-line` from the watcher activity
//! and `step-change` from the pipeline workflow. Lines are processed
//! strictly FIFO; each is saved raw first (transcript preservation), then
//! parsed, updated and published. Transcript failures increment a counter
//! and never fail the workflow — a broken transcript must never fail a
//! pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::EngineEvent;
use crate::model::{task_id, AiActivityRecord};
use crate::runtime::{
    signal_channel, ActivityError, ActivityOptions, CancelToken, SignalReceiver, SignalSender,
};
use crate::transcript::{watch_transcripts, ParsedRecord, RawLineSignal, WatcherConfig};

use super::{OrchestratorContext, RunContext};

/// Start-to-close bound on the watcher activity; effectively "the whole
/// pipeline", enforced by heartbeats rather than this ceiling.
const WATCHER_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
/// Heartbeat timeout for the watcher.
const WATCHER_HEARTBEAT: Duration = Duration::from_secs(60);
/// Timeout for the per-line persistence and parse activities.
const LINE_TIMEOUT: Duration = Duration::from_secs(30);

/// Inputs to the observability workflow.
#[derive(Debug, Clone)]
pub struct ObservabilityInput {
    pub run_id: String,
    pub project_id: String,
    /// Transcript directory the watcher tails.
    pub transcript_dir: PathBuf,
    /// Adapter tag.
    pub source: String,
    /// Watcher poll cadence.
    pub poll_interval: Duration,
}

/// Outputs reported when the workflow is terminated.
#[derive(Debug, Clone, Default)]
pub struct ObservabilityOutput {
    /// Lines saved and processed.
    pub events_count: u64,
    /// Lines lost to save failures (surfaced, never fatal).
    pub failed_events_count: u64,
}

/// Sender half of the `step-change` signal, held by the pipeline
/// workflow.
#[derive(Clone)]
pub struct ObservabilityHandle {
    step_changes: SignalSender<String>,
}

impl ObservabilityHandle {
    /// Signals that transcript lines read from now on belong to `step_id`
    /// (empty for "outside any step").
    pub fn signal_step_change(&self, step_id: &str) {
        if self.step_changes.send(step_id.to_string()).is_err() {
            debug!("observability workflow gone; step-change dropped");
        }
    }
}

/// Creates the `step-change` signal pair.
pub fn observability_channel() -> (ObservabilityHandle, SignalReceiver<String>) {
    let (tx, rx) = signal_channel();
    (ObservabilityHandle { step_changes: tx }, rx)
}

/// Outcome of parsing one raw line.
struct ParseOutcome {
    success: bool,
    records: Vec<ParsedRecord>,
}

/// Runs the observability workflow until cancelled by its parent.
pub async fn run_observability(
    octx: OrchestratorContext,
    rctx: RunContext,
    cancel: CancelToken,
    input: ObservabilityInput,
    mut step_changes: SignalReceiver<String>,
) -> ObservabilityOutput {
    info!(run_id = %input.run_id, "observability: starting");

    let (raw_tx, mut raw_rx) = signal_channel::<RawLineSignal>();

    // Start the watcher on the run-scoped queue and do not wait for it:
    // it completes only on cancellation.
    let watcher = {
        let queue = rctx.queue.clone();
        let cancel = cancel.child();
        let config = WatcherConfig::new(
            input.transcript_dir.clone(),
            input.run_id.clone(),
            input.project_id.clone(),
        )
        .with_source(input.source.clone())
        .with_poll_interval(input.poll_interval);
        tokio::spawn(async move {
            let opts = ActivityOptions::new(WATCHER_TIMEOUT).with_heartbeat(WATCHER_HEARTBEAT);
            queue
                .execute("TranscriptWatcher", &opts, &cancel, move |ctx| {
                    let config = config.clone();
                    let raw_tx = raw_tx.clone();
                    async move {
                        watch_transcripts(config, ctx, raw_tx)
                            .await
                            .map_err(ActivityError::failed)
                    }
                })
                .await
        })
    };

    let mut current_step_id = String::new();
    let mut output = ObservabilityOutput::default();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(step_id) = step_changes.recv() => {
                debug!(run_id = %input.run_id, step_id = %step_id, "observability: step change");
                current_step_id = step_id;
            }
            Some(line) = raw_rx.recv() => {
                process_line(&octx, &cancel, &input, &current_step_id, line, &mut output).await;
            }
            else => break,
        }
    }

    drop(watcher);
    info!(
        run_id = %input.run_id,
        events = output.events_count,
        failed = output.failed_events_count,
        "observability: stopping"
    );
    output
}

/// Save → parse → update → publish, for one raw transcript line.
async fn process_line(
    octx: &OrchestratorContext,
    cancel: &CancelToken,
    input: &ObservabilityInput,
    current_step_id: &str,
    line: RawLineSignal,
    output: &mut ObservabilityOutput,
) {
    let step_task_id = task_id(&input.run_id, current_step_id);
    let event_id = Uuid::new_v4().to_string();
    let raw_record = AiActivityRecord::raw(
        event_id.clone(),
        step_task_id.clone(),
        input.run_id.clone(),
        current_step_id.to_string(),
        input.project_id.clone(),
        line.source.clone(),
        line.raw_line.clone(),
        line.timestamp,
    );

    // 1. Save the raw placeholder. Data loss is surfaced as a counter,
    // never as a workflow failure.
    let saved = {
        let data = Arc::clone(&octx.data);
        let record = raw_record.clone();
        octx.queue
            .execute(
                "SaveRawEvent",
                &ActivityOptions::new(LINE_TIMEOUT),
                cancel,
                move |_ctx| {
                    let data = Arc::clone(&data);
                    let record = record.clone();
                    async move {
                        data.save_activity_record(&record)
                            .await
                            .map_err(ActivityError::failed)
                    }
                },
            )
            .await
    };
    if let Err(err) = saved {
        warn!(run_id = %input.run_id, error = %err, "failed to save transcript line");
        output.failed_events_count += 1;
        octx.publish_event(
            cancel,
            EngineEvent::Error {
                task_id: step_task_id,
                message: format!("transcript line lost: {}", err),
                context: "save-raw-event".to_string(),
            },
        )
        .await;
        return;
    }
    output.events_count += 1;

    // 2. Parse. Unknown sources and malformed lines yield no records; the
    // raw payload is already durable.
    let outcome = {
        let adapters = Arc::clone(&octx.adapters);
        let source = line.source.clone();
        let raw = line.raw_line.clone();
        let line_number = line.line_number;
        let session_id = line.session_id.clone();
        octx.queue
            .execute(
                "ParseEvent",
                &ActivityOptions::new(LINE_TIMEOUT),
                cancel,
                move |_ctx| {
                    let adapters = Arc::clone(&adapters);
                    let source = source.clone();
                    let raw = raw.clone();
                    let session_id = session_id.clone();
                    async move {
                        let Some(adapter) = adapters.get(&source) else {
                            return Ok(ParseOutcome { success: false, records: Vec::new() });
                        };
                        let entry = crate::transcript::RawEntry {
                            line_number,
                            data: raw,
                            session_id,
                        };
                        match adapter.parse_entry(&entry) {
                            Ok(records) => Ok(ParseOutcome { success: true, records }),
                            Err(_) => Ok(ParseOutcome { success: false, records: Vec::new() }),
                        }
                    }
                },
            )
            .await
    };
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(run_id = %input.run_id, error = %err, "parse activity failed");
            return;
        }
    };
    if !outcome.success {
        debug!(run_id = %input.run_id, "transcript line kept raw (no parse)");
        return;
    }

    // 3. Update each parsed record and publish it.
    for (i, parsed) in outcome.records.into_iter().enumerate() {
        let mut record = raw_record.clone();
        record.event_id = AiActivityRecord::derived_event_id(&event_id, i);
        record.event_type = parsed.event_type;
        record.tool_name = parsed.tool_name;
        record.input_summary = parsed.input_summary;
        record.content_preview = parsed.content_preview;
        record.tokens = parsed.tokens;

        let updated = {
            let data = Arc::clone(&octx.data);
            let record = record.clone();
            octx.queue
                .execute(
                    "UpdateParsedEvent",
                    &ActivityOptions::new(LINE_TIMEOUT),
                    cancel,
                    move |_ctx| {
                        let data = Arc::clone(&data);
                        let record = record.clone();
                        async move {
                            data.update_activity_record(&record)
                                .await
                                .map_err(ActivityError::failed)
                        }
                    },
                )
                .await
        };
        if let Err(err) = updated {
            warn!(run_id = %input.run_id, error = %err, "failed to update parsed event");
            continue;
        }

        octx.publish_event(cancel, EngineEvent::AiActivity { record: Box::new(record) })
            .await;
    }
}
