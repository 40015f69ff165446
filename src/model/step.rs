//! Step definitions, agent configuration, and persisted step results.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How boolean/value flags are rendered into the agent argv.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagFormat {
    /// `--key value`
    #[default]
    Space,
    /// `--key=value`
    Equals,
}

impl FlagFormat {
    /// Stable string form, used in fingerprinting.
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagFormat::Space => "space",
            FlagFormat::Equals => "equals",
        }
    }
}

/// Configuration of the external agent tool invoked by a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Adapter tag of the tool (e.g. `claude`).
    pub tool_name: String,
    /// Tool version constraint, informational.
    #[serde(default)]
    pub tool_version: String,
    /// Prompt template; runtime variables are substituted literally.
    pub prompt_template: String,
    /// Template variables, substituted into the prompt by the adapter.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Opaque tool options rendered as command-line flags.
    #[serde(default)]
    pub tool_options: BTreeMap<String, serde_json::Value>,
    /// Flag rendering style.
    #[serde(default)]
    pub flag_format: FlagFormat,
}

impl AgentConfig {
    /// Creates a config for the given tool and prompt template.
    pub fn new(tool_name: impl Into<String>, prompt_template: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            prompt_template: prompt_template.into(),
            ..Default::default()
        }
    }

    /// Adds a template variable.
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Adds a tool option.
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.tool_options.insert(key.into(), value);
        self
    }

    /// Sets the flag format.
    pub fn with_flag_format(mut self, format: FlagFormat) -> Self {
        self.flag_format = format;
        self
    }
}

/// One node of a pipeline definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Identifier, unique within the pipeline.
    pub step_id: String,
    /// Human-readable name; also used in the commit message.
    pub name: String,
    /// Reserved for future DAG execution; the engine runs steps linearly.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Step-level options, opaque to the engine.
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
    /// Agent invocation config.
    pub agent: Option<AgentConfig>,
}

impl StepDefinition {
    /// Creates a step definition without an agent config.
    pub fn new(step_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Sets the agent config.
    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Adds a step-level option.
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

/// Status of a persisted step result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Inherited from a parent run via a fork; the agent was not invoked.
    Skipped,
}

impl StepStatus {
    /// Stable string form used by the storage layer.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Parses the storage form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StepStatus::Pending),
            "running" => Some(StepStatus::Running),
            "completed" => Some(StepStatus::Completed),
            "failed" => Some(StepStatus::Failed),
            "skipped" => Some(StepStatus::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token counters reported by the agent tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    /// Adds another counter set into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
    }

    /// True when every counter is zero.
    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_read_tokens == 0
            && self.cache_creation_tokens == 0
    }
}

/// Persisted record of one executed (or skipped) step of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Unique row id.
    pub id: String,
    /// Owning run.
    pub pipeline_run_id: String,
    /// Step identifier from the definition.
    pub step_id: String,
    /// Position in the pipeline, 0-based.
    pub step_index: usize,
    /// Lifecycle status.
    pub status: StepStatus,
    /// Commit produced by the step, if any.
    pub commit_sha: Option<String>,
    /// Commit message used.
    pub commit_message: Option<String>,
    /// Raw diff captured against the previous commit.
    pub git_diff: Option<String>,
    /// Paths touched by the step.
    pub files_changed: Vec<String>,
    /// Inserted line count across all files.
    pub insertions: u64,
    /// Deleted line count across all files.
    pub deletions: u64,
    /// Token counters extracted from the agent's final output.
    pub tokens: TokenUsage,
    /// Final textual output of the agent.
    pub agent_output: Option<String>,
    /// Wall-clock duration of the step.
    pub duration: Duration,
    /// Failure reason, when status is Failed.
    pub error_message: Option<String>,
    /// Fingerprint of the step definition; drives fork-prefix matching.
    pub definition_hash: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl StepResult {
    /// Creates a pending result for the given run and step.
    pub fn pending(
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        step_index: usize,
        definition_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pipeline_run_id: run_id.into(),
            step_id: step_id.into(),
            step_index,
            status: StepStatus::Pending,
            commit_sha: None,
            commit_message: None,
            git_diff: None,
            files_changed: Vec::new(),
            insertions: 0,
            deletions: 0,
            tokens: TokenUsage::default(),
            agent_output: None,
            duration: Duration::ZERO,
            error_message: None,
            definition_hash: definition_hash.into(),
            created_at: Utc::now(),
        }
    }

    /// Derives a Skipped result for a forked run from the parent's result at
    /// the same index. The commit chain is inherited unchanged.
    pub fn skipped_from(parent: &StepResult, run_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pipeline_run_id: run_id.to_string(),
            status: StepStatus::Skipped,
            duration: Duration::ZERO,
            agent_output: None,
            error_message: None,
            created_at: Utc::now(),
            ..parent.clone()
        }
    }
}
