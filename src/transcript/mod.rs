//! Transcript adapters and the transcript directory watcher.
//!
//! AI tools write a JSON-Lines transcript of their internal events. One
//! adapter per vendor turns raw lines into structured activity records
//! and renders the tool's argv; the watcher tails the transcript
//! directory inside the run container and forwards lines to the
//! observability workflow. Parsing never happens in the container — raw
//! lines travel as signals and are parsed on the orchestrator side.

mod claude;
mod watcher;

pub use claude::ClaudeAdapter;
pub use watcher::{watch_transcripts, RawLineSignal, WatcherConfig};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::model::{AgentConfig, TokenUsage};

/// Well-known activity event types produced by adapters.
pub mod event_types {
    pub const TOOL_USE: &str = "tool_use";
    pub const TOOL_RESULT: &str = "tool_result";
    pub const THINKING: &str = "thinking";
    pub const TEXT: &str = "text";
    pub const SYSTEM: &str = "system";
    pub const SESSION_SUMMARY: &str = "session_summary";
    pub const ERROR: &str = "error";
}

/// Errors from transcript parsing.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed transcript entry at line {line}: {reason}")]
    Malformed { line: u64, reason: String },

    #[error("no adapter registered for source '{0}'")]
    UnknownSource(String),
}

/// A raw transcript line handed to an adapter.
#[derive(Debug, Clone)]
pub struct RawEntry {
    /// 1-based line number within the transcript file.
    pub line_number: u64,
    /// The raw line content.
    pub data: String,
    /// Session id derived from the transcript file name.
    pub session_id: String,
}

/// One structured record parsed from a transcript entry. A single entry
/// may decompose into several records (a thinking block followed by a
/// tool invocation, say); the engine assigns each a derived event id.
#[derive(Debug, Clone, Default)]
pub struct ParsedRecord {
    /// Event type tag; see [`event_types`].
    pub event_type: String,
    /// Tool invoked, for tool events.
    pub tool_name: Option<String>,
    /// Short structured summary of the tool input.
    pub input_summary: Option<String>,
    /// Truncated preview of the textual content.
    pub content_preview: Option<String>,
    /// Token counters attached to the entry.
    pub tokens: TokenUsage,
}

/// Final output extracted from an agent invocation's stdout.
#[derive(Debug, Clone, Default)]
pub struct FinalOutput {
    /// The agent's final textual answer.
    pub text: Option<String>,
    /// Token counters for the whole invocation.
    pub tokens: TokenUsage,
}

/// A vendor adapter: transcript parsing plus argv rendering.
///
/// Rendering must be pure — the same config and prompt always produce the
/// same argv — because it participates in replayed workflows.
pub trait ToolAdapter: Send + Sync {
    /// Source tag this adapter is registered under.
    fn source(&self) -> &'static str;

    /// Parses one transcript entry into zero or more records.
    fn parse_entry(&self, entry: &RawEntry) -> Result<Vec<ParsedRecord>, AdapterError>;

    /// Renders the executable argv for an agent invocation.
    fn render_argv(&self, config: &AgentConfig, prompt: &str) -> Vec<String>;

    /// Extracts the final answer and token counters from captured stdout.
    fn parse_final_output(&self, stdout: &str) -> FinalOutput {
        FinalOutput {
            text: if stdout.is_empty() {
                None
            } else {
                Some(stdout.to_string())
            },
            tokens: TokenUsage::default(),
        }
    }

    /// Host and container paths of the tool's credential file, when the
    /// vendor has one worth injecting.
    fn credential_file(&self) -> Option<(PathBuf, PathBuf)> {
        None
    }
}

/// Registry of adapters keyed by source tag.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn ToolAdapter>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every built-in adapter registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ClaudeAdapter::new()));
        registry
    }

    /// Registers an adapter under its source tag.
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        self.adapters.insert(adapter.source(), adapter);
    }

    /// Looks up an adapter by source tag.
    pub fn get(&self, source: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters.get(source).cloned()
    }

    /// Registered source tags.
    pub fn sources(&self) -> Vec<&'static str> {
        self.adapters.keys().copied().collect()
    }
}

/// Truncates text to a preview of at most `max` chars on a char boundary.
pub(crate) fn preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max).collect();
    format!("{}...", truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_with_defaults_has_claude() {
        let registry = AdapterRegistry::with_defaults();
        assert!(registry.get("claude").is_some());
        assert!(registry.get("unknown-vendor").is_none());
        assert!(registry.sources().contains(&"claude"));
    }

    #[test]
    fn test_preview_truncation() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("abcdefgh", 4), "abcd...");
    }
}
