//! Engine event bus.
//!
//! Lifecycle and AI-activity events fan out to external observers (API
//! server, TUI, ...). Every event carries an idempotency key and a
//! protocol version; consumers must deduplicate, because publish retries
//! can deliver an event more than once.

mod broadcast;

pub use broadcast::BroadcastBus;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{AiActivityRecord, PipelineRun, StepResult};

/// Version stamped on every envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a publish call; a saturated bus fails the publish
/// activity, which retries per the normal policy.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from publishing to the bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus did not accept the event within [`PUBLISH_TIMEOUT`].
    #[error("event bus publish timed out after {0:?}")]
    Timeout(Duration),

    /// The bus rejected the event.
    #[error("event bus rejected event: {0}")]
    Rejected(String),
}

/// Events emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    PipelineCreated {
        project_id: String,
        run_id: String,
        name: String,
        run: Box<PipelineRun>,
    },
    PipelineStepStarted {
        project_id: String,
        run_id: String,
        step_id: String,
        step_index: usize,
        step_name: String,
    },
    PipelineStepCompleted {
        project_id: String,
        run_id: String,
        step_result: Box<StepResult>,
    },
    PipelineStepFailed {
        project_id: String,
        run_id: String,
        step_result: Box<StepResult>,
    },
    PipelineFinished {
        project_id: String,
        run_id: String,
        name: String,
        run: Box<PipelineRun>,
    },
    PipelineFailed {
        project_id: String,
        run_id: String,
        name: String,
    },
    AiActivity {
        record: Box<AiActivityRecord>,
    },
    /// Out-of-band failure surfaced to observers.
    Error {
        task_id: String,
        message: String,
        context: String,
    },
}

impl EngineEvent {
    /// Short kind tag, used in idempotency keys and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::PipelineCreated { .. } => "pipeline-created",
            EngineEvent::PipelineStepStarted { .. } => "step-started",
            EngineEvent::PipelineStepCompleted { .. } => "step-completed",
            EngineEvent::PipelineStepFailed { .. } => "step-failed",
            EngineEvent::PipelineFinished { .. } => "pipeline-finished",
            EngineEvent::PipelineFailed { .. } => "pipeline-failed",
            EngineEvent::AiActivity { .. } => "ai-activity",
            EngineEvent::Error { .. } => "error",
        }
    }

    /// Deduplication key for downstream consumers.
    ///
    /// Lifecycle events use `<kind>-<project_id>-<entity_id>`; AI activity
    /// uses the record's event id.
    pub fn idempotency_key(&self) -> String {
        match self {
            EngineEvent::PipelineCreated { project_id, run_id, .. }
            | EngineEvent::PipelineFinished { project_id, run_id, .. }
            | EngineEvent::PipelineFailed { project_id, run_id, .. } => {
                format!("{}-{}-{}", self.kind(), project_id, run_id)
            }
            EngineEvent::PipelineStepStarted { project_id, run_id, step_id, .. } => {
                format!("{}-{}-{}-{}", self.kind(), project_id, run_id, step_id)
            }
            EngineEvent::PipelineStepCompleted { project_id, step_result, .. }
            | EngineEvent::PipelineStepFailed { project_id, step_result, .. } => {
                format!(
                    "{}-{}-{}-{}",
                    self.kind(),
                    project_id,
                    step_result.pipeline_run_id,
                    step_result.step_id
                )
            }
            EngineEvent::AiActivity { record } => record.event_id.clone(),
            EngineEvent::Error { task_id, .. } => format!("{}-{}", self.kind(), task_id),
        }
    }
}

/// Envelope metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    pub idempotency_key: String,
    pub protocol_version: u32,
}

/// An event plus its metadata, as delivered to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub metadata: EventMetadata,
    pub event: EngineEvent,
}

impl EventEnvelope {
    /// Wraps an event with its derived metadata.
    pub fn new(event: EngineEvent) -> Self {
        Self {
            metadata: EventMetadata {
                idempotency_key: event.idempotency_key(),
                protocol_version: PROTOCOL_VERSION,
            },
            event,
        }
    }
}

/// Producer-side bus contract. Implementations must return within
/// [`PUBLISH_TIMEOUT`].
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_idempotency_key() {
        let event = EngineEvent::PipelineFailed {
            project_id: "proj".to_string(),
            run_id: "run-1".to_string(),
            name: "demo".to_string(),
        };
        assert_eq!(event.idempotency_key(), "pipeline-failed-proj-run-1");
    }

    #[test]
    fn test_activity_idempotency_key_is_event_id() {
        let record = AiActivityRecord::raw(
            "ev-42",
            "run-1-s1",
            "run-1",
            "s1",
            "proj",
            "claude",
            "{}",
            chrono::Utc::now(),
        );
        let event = EngineEvent::AiActivity { record: Box::new(record) };
        assert_eq!(event.idempotency_key(), "ev-42");
    }

    #[test]
    fn test_envelope_carries_protocol_version() {
        let envelope = EventEnvelope::new(EngineEvent::Error {
            task_id: "t".to_string(),
            message: "m".to_string(),
            context: "c".to_string(),
        });
        assert_eq!(envelope.metadata.protocol_version, PROTOCOL_VERSION);
        assert_eq!(envelope.metadata.idempotency_key, "error-t");
    }
}
