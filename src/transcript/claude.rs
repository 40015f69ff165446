//! Claude Code transcript adapter.
//!
//! Parses the JSONL session files Claude Code writes (one JSON object per
//! line, discriminated by `type`) and renders the `claude` CLI argv for
//! headless invocations.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use crate::identity::canonical_json;
use crate::model::{AgentConfig, FlagFormat, TokenUsage};

use super::{
    event_types, preview, AdapterError, FinalOutput, ParsedRecord, RawEntry, ToolAdapter,
};

/// Max chars of content preview stored on a record.
const PREVIEW_LEN: usize = 200;
/// Max chars of a summarised tool input.
const INPUT_SUMMARY_LEN: usize = 120;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TranscriptLine {
    User(MessageEntry),
    Assistant(MessageEntry),
    System(SystemEntry),
    Summary(SummaryEntry),
    Result(ResultEntry),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
struct MessageEntry {
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Default, Deserialize)]
struct Message {
    #[serde(default)]
    content: Content,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for Content {
    fn default() -> Self {
        Content::Text(String::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        content: Option<Value>,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

impl From<&Usage> for TokenUsage {
    fn from(usage: &Usage) -> Self {
        TokenUsage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_input_tokens,
            cache_creation_tokens: usage.cache_creation_input_tokens,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SystemEntry {
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    content: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SummaryEntry {
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Default, Deserialize)]
struct ResultEntry {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

/// Adapter for Claude Code.
#[derive(Debug, Default)]
pub struct ClaudeAdapter;

impl ClaudeAdapter {
    /// Creates the adapter.
    pub fn new() -> Self {
        Self
    }
}

/// Picks a short human-readable summary out of a tool input object.
fn summarize_input(input: &Value) -> Option<String> {
    const KNOWN_KEYS: [&str; 7] = [
        "file_path", "path", "command", "pattern", "query", "url", "prompt",
    ];

    if let Value::Object(map) = input {
        for key in KNOWN_KEYS {
            if let Some(Value::String(s)) = map.get(key) {
                return Some(preview(&format!("{}={}", key, s), INPUT_SUMMARY_LEN));
            }
        }
        if map.is_empty() {
            return None;
        }
    }
    Some(preview(&canonical_json(input), INPUT_SUMMARY_LEN))
}

/// Extracts preview text from a tool result's content, which may be a
/// plain string or an array of content blocks.
fn tool_result_preview(content: &Option<Value>) -> Option<String> {
    let content = content.as_ref()?;
    match content {
        Value::String(s) => Some(preview(s, PREVIEW_LEN)),
        Value::Array(blocks) => {
            let text: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(preview(&text.join("\n"), PREVIEW_LEN))
            }
        }
        other => Some(preview(&canonical_json(other), PREVIEW_LEN)),
    }
}

fn parse_message_blocks(entry: &MessageEntry, from_assistant: bool) -> Vec<ParsedRecord> {
    let Some(message) = &entry.message else {
        return Vec::new();
    };

    let mut records = Vec::new();
    match &message.content {
        Content::Text(text) => {
            if from_assistant && !text.is_empty() {
                records.push(ParsedRecord {
                    event_type: event_types::TEXT.to_string(),
                    content_preview: Some(preview(text, PREVIEW_LEN)),
                    ..Default::default()
                });
            }
        }
        Content::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } if from_assistant => {
                        records.push(ParsedRecord {
                            event_type: event_types::TEXT.to_string(),
                            content_preview: Some(preview(text, PREVIEW_LEN)),
                            ..Default::default()
                        });
                    }
                    ContentBlock::Thinking { thinking } if from_assistant => {
                        records.push(ParsedRecord {
                            event_type: event_types::THINKING.to_string(),
                            content_preview: Some(preview(thinking, PREVIEW_LEN)),
                            ..Default::default()
                        });
                    }
                    ContentBlock::ToolUse { name, input } if from_assistant => {
                        records.push(ParsedRecord {
                            event_type: event_types::TOOL_USE.to_string(),
                            tool_name: Some(name.clone()),
                            input_summary: summarize_input(input),
                            ..Default::default()
                        });
                    }
                    ContentBlock::ToolResult { content, is_error } if !from_assistant => {
                        let event_type = if is_error.unwrap_or(false) {
                            event_types::ERROR
                        } else {
                            event_types::TOOL_RESULT
                        };
                        records.push(ParsedRecord {
                            event_type: event_type.to_string(),
                            content_preview: tool_result_preview(content),
                            ..Default::default()
                        });
                    }
                    _ => {}
                }
            }
        }
    }

    // Token counters are attached to the entry, not to a block; record
    // them once, on the first parsed record.
    if let (Some(usage), Some(first)) = (&message.usage, records.first_mut()) {
        first.tokens = TokenUsage::from(usage);
    }

    records
}

impl ToolAdapter for ClaudeAdapter {
    fn source(&self) -> &'static str {
        "claude"
    }

    fn parse_entry(&self, entry: &RawEntry) -> Result<Vec<ParsedRecord>, AdapterError> {
        let line: TranscriptLine =
            serde_json::from_str(&entry.data).map_err(|e| AdapterError::Malformed {
                line: entry.line_number,
                reason: e.to_string(),
            })?;

        let records = match &line {
            TranscriptLine::Assistant(message) => parse_message_blocks(message, true),
            TranscriptLine::User(message) => parse_message_blocks(message, false),
            TranscriptLine::System(system) => {
                let text = system
                    .content
                    .as_ref()
                    .and_then(Value::as_str)
                    .or(system.subtype.as_deref());
                vec![ParsedRecord {
                    event_type: event_types::SYSTEM.to_string(),
                    content_preview: text.map(|t| preview(t, PREVIEW_LEN)),
                    ..Default::default()
                }]
            }
            TranscriptLine::Summary(summary) => vec![ParsedRecord {
                event_type: event_types::SESSION_SUMMARY.to_string(),
                content_preview: Some(preview(&summary.summary, PREVIEW_LEN)),
                ..Default::default()
            }],
            TranscriptLine::Result(result) => {
                let mut record = ParsedRecord {
                    event_type: event_types::TEXT.to_string(),
                    content_preview: result.result.as_deref().map(|r| preview(r, PREVIEW_LEN)),
                    ..Default::default()
                };
                if let Some(usage) = &result.usage {
                    record.tokens = TokenUsage::from(usage);
                }
                vec![record]
            }
            TranscriptLine::Unknown => Vec::new(),
        };

        Ok(records)
    }

    fn render_argv(&self, config: &AgentConfig, prompt: &str) -> Vec<String> {
        // Template variables are substituted literally, in ascending key
        // order, same as everywhere else prompts are assembled.
        let mut rendered_prompt = prompt.to_string();
        for (key, value) in &config.variables {
            rendered_prompt = rendered_prompt.replace(&format!("{{{{{}}}}}", key), value);
        }

        let mut argv = vec![
            "claude".to_string(),
            "-p".to_string(),
            rendered_prompt,
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        for (key, value) in &config.tool_options {
            let flag = if key.starts_with('-') {
                key.clone()
            } else {
                format!("--{}", key)
            };
            let rendered = match value {
                Value::Bool(true) => {
                    argv.push(flag);
                    continue;
                }
                Value::Bool(false) => continue,
                Value::String(s) => s.clone(),
                other => canonical_json(other),
            };
            match config.flag_format {
                FlagFormat::Space => {
                    argv.push(flag);
                    argv.push(rendered);
                }
                FlagFormat::Equals => {
                    argv.push(format!("{}={}", flag, rendered));
                }
            }
        }

        argv
    }

    fn parse_final_output(&self, stdout: &str) -> FinalOutput {
        // Headless stream-json output ends with a `result` line carrying
        // the final answer and the invocation's token counters.
        for line in stdout.lines().rev() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(TranscriptLine::Result(result)) = serde_json::from_str(line) {
                return FinalOutput {
                    text: result.result,
                    tokens: result.usage.as_ref().map(TokenUsage::from).unwrap_or_default(),
                };
            }
        }

        let trimmed = stdout.trim();
        FinalOutput {
            text: if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            },
            tokens: TokenUsage::default(),
        }
    }

    fn credential_file(&self) -> Option<(PathBuf, PathBuf)> {
        let host = crate::container::home_path(".claude/.credentials.json")?;
        Some((host, PathBuf::from("/root/.claude/.credentials.json")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(data: &str) -> RawEntry {
        RawEntry {
            line_number: 1,
            data: data.to_string(),
            session_id: "session".to_string(),
        }
    }

    #[test]
    fn test_parse_assistant_tool_use_and_thinking() {
        let adapter = ClaudeAdapter::new();
        let line = json!({
            "type": "assistant",
            "message": {
                "content": [
                    {"type": "thinking", "thinking": "I should read the file first"},
                    {"type": "tool_use", "name": "Read", "input": {"file_path": "src/main.rs"}}
                ],
                "usage": {"input_tokens": 120, "output_tokens": 8}
            }
        });

        let records = adapter.parse_entry(&entry(&line.to_string())).unwrap();
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].event_type, "thinking");
        assert_eq!(records[0].tokens.input_tokens, 120);

        assert_eq!(records[1].event_type, "tool_use");
        assert_eq!(records[1].tool_name.as_deref(), Some("Read"));
        assert_eq!(
            records[1].input_summary.as_deref(),
            Some("file_path=src/main.rs")
        );
        assert!(records[1].tokens.is_zero());
    }

    #[test]
    fn test_parse_user_tool_result() {
        let adapter = ClaudeAdapter::new();
        let line = json!({
            "type": "user",
            "message": {
                "content": [
                    {"type": "tool_result", "content": "fn main() {}"}
                ]
            }
        });

        let records = adapter.parse_entry(&entry(&line.to_string())).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, "tool_result");
        assert_eq!(records[0].content_preview.as_deref(), Some("fn main() {}"));
    }

    #[test]
    fn test_parse_errored_tool_result() {
        let adapter = ClaudeAdapter::new();
        let line = json!({
            "type": "user",
            "message": {
                "content": [
                    {"type": "tool_result", "content": "no such file", "is_error": true}
                ]
            }
        });

        let records = adapter.parse_entry(&entry(&line.to_string())).unwrap();
        assert_eq!(records[0].event_type, "error");
    }

    #[test]
    fn test_parse_summary() {
        let adapter = ClaudeAdapter::new();
        let records = adapter
            .parse_entry(&entry(r#"{"type":"summary","summary":"Fixed the login bug"}"#))
            .unwrap();
        assert_eq!(records[0].event_type, "session_summary");
        assert_eq!(
            records[0].content_preview.as_deref(),
            Some("Fixed the login bug")
        );
    }

    #[test]
    fn test_parse_unknown_type_produces_nothing() {
        let adapter = ClaudeAdapter::new();
        let records = adapter
            .parse_entry(&entry(r#"{"type":"file-history-snapshot","messageId":"x"}"#))
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_parse_malformed_line_errors() {
        let adapter = ClaudeAdapter::new();
        assert!(adapter.parse_entry(&entry("not json at all")).is_err());
    }

    #[test]
    fn test_render_argv_space_format() {
        let adapter = ClaudeAdapter::new();
        let config = AgentConfig::new("claude", "unused")
            .with_option("model", json!("opus"))
            .with_option("dangerously-skip-permissions", json!(true));

        let argv = adapter.render_argv(&config, "fix the bug");
        assert_eq!(argv[0], "claude");
        assert_eq!(argv[1], "-p");
        assert_eq!(argv[2], "fix the bug");
        assert!(argv.contains(&"--dangerously-skip-permissions".to_string()));
        let model_pos = argv.iter().position(|a| a == "--model").unwrap();
        assert_eq!(argv[model_pos + 1], "opus");
    }

    #[test]
    fn test_render_argv_equals_format() {
        let adapter = ClaudeAdapter::new();
        let config = AgentConfig::new("claude", "unused")
            .with_option("model", json!("opus"))
            .with_flag_format(FlagFormat::Equals);

        let argv = adapter.render_argv(&config, "go");
        assert!(argv.contains(&"--model=opus".to_string()));
    }

    #[test]
    fn test_render_argv_substitutes_variables() {
        let adapter = ClaudeAdapter::new();
        let config = AgentConfig::new("claude", "unused").with_variable("target", "src/lib.rs");

        let argv = adapter.render_argv(&config, "refactor {{target}} now");
        assert_eq!(argv[2], "refactor src/lib.rs now");
    }

    #[test]
    fn test_render_argv_is_deterministic() {
        let adapter = ClaudeAdapter::new();
        let config = AgentConfig::new("claude", "unused")
            .with_option("b-flag", json!("2"))
            .with_option("a-flag", json!("1"));

        let first = adapter.render_argv(&config, "p");
        let second = adapter.render_argv(&config, "p");
        assert_eq!(first, second);
        // Options render in ascending key order.
        let a = first.iter().position(|x| x == "--a-flag").unwrap();
        let b = first.iter().position(|x| x == "--b-flag").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_parse_final_output_result_line() {
        let adapter = ClaudeAdapter::new();
        let stdout = format!(
            "{}\n{}\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"working"}]}}"#,
            r#"{"type":"result","result":"All done","usage":{"input_tokens":500,"output_tokens":42,"cache_read_input_tokens":100}}"#
        );

        let output = adapter.parse_final_output(&stdout);
        assert_eq!(output.text.as_deref(), Some("All done"));
        assert_eq!(output.tokens.input_tokens, 500);
        assert_eq!(output.tokens.output_tokens, 42);
        assert_eq!(output.tokens.cache_read_tokens, 100);
    }

    #[test]
    fn test_parse_final_output_fallback_to_raw() {
        let adapter = ClaudeAdapter::new();
        let output = adapter.parse_final_output("plain text answer\n");
        assert_eq!(output.text.as_deref(), Some("plain text answer"));
        assert!(output.tokens.is_zero());
    }
}
