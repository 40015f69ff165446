//! Parsed AI activity records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::step::TokenUsage;

/// One event derived from an agent transcript line.
///
/// Written twice: first as a raw placeholder (only the payload and routing
/// fields), then updated with the parsed fields once the adapter has run.
/// The raw payload is always preserved verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiActivityRecord {
    /// Unique event id. Entries that decompose into several records share a
    /// root id with `-<i>` suffixes for the records after the first.
    pub event_id: String,
    /// Step-scoped task id (`<run_id>-<step_id>`).
    pub task_id: String,
    /// Owning run.
    pub run_id: String,
    /// Step active when the line was read; empty outside any step.
    pub step_id: String,
    /// Owning project.
    pub project_id: String,
    /// Adapter tag the line came from.
    pub source: String,
    /// Parsed event type (`tool_use`, `tool_result`, `thinking`, `text`,
    /// ...); empty until parsing succeeds.
    pub event_type: String,
    /// Event timestamp (transcript-reported when available, else read time).
    pub timestamp: DateTime<Utc>,
    /// Tool invoked, for tool events.
    pub tool_name: Option<String>,
    /// Short structured summary of the tool input.
    pub input_summary: Option<String>,
    /// Truncated preview of the textual content.
    pub content_preview: Option<String>,
    /// Token counters attached to the event.
    pub tokens: TokenUsage,
    /// The original transcript line, verbatim.
    pub raw_payload: String,
}

impl AiActivityRecord {
    /// Creates a raw placeholder record for an unparsed transcript line.
    pub fn raw(
        event_id: impl Into<String>,
        task_id: impl Into<String>,
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        project_id: impl Into<String>,
        source: impl Into<String>,
        raw_payload: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            task_id: task_id.into(),
            run_id: run_id.into(),
            step_id: step_id.into(),
            project_id: project_id.into(),
            source: source.into(),
            event_type: String::new(),
            timestamp,
            tool_name: None,
            input_summary: None,
            content_preview: None,
            tokens: TokenUsage::default(),
            raw_payload: raw_payload.into(),
        }
    }

    /// Derives the event id for the `i`-th record parsed out of one entry.
    pub fn derived_event_id(root: &str, i: usize) -> String {
        if i == 0 {
            root.to_string()
        } else {
            format!("{}-{}", root, i)
        }
    }
}
