//! Projects and pipeline definitions.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::step::StepDefinition;

/// A git repository registered with the engine.
///
/// The `repository_path` must point to a readable git working tree for the
/// lifetime of every run that cites the project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Unique project identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Local filesystem path of the git repository.
    pub repository_path: PathBuf,
}

impl Project {
    /// Creates a new project.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        repository_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            repository_path: repository_path.into(),
        }
    }
}

/// A reusable pipeline recipe: an ordered sequence of step definitions plus
/// an optional prompt prefix/suffix wrapped around every step's prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Unique pipeline identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Ordered step definitions; execution is strictly linear.
    pub steps: Vec<StepDefinition>,
    /// Prepended to every step's prompt template. Empty means none.
    #[serde(default)]
    pub prompt_prefix: String,
    /// Appended to every step's prompt template. Empty means none.
    #[serde(default)]
    pub prompt_suffix: String,
}

impl PipelineDefinition {
    /// Creates an empty pipeline definition.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps: Vec::new(),
            prompt_prefix: String::new(),
            prompt_suffix: String::new(),
        }
    }

    /// Appends a step.
    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Sets the prompt prefix.
    pub fn with_prompt_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prompt_prefix = prefix.into();
        self
    }

    /// Sets the prompt suffix.
    pub fn with_prompt_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.prompt_suffix = suffix.into();
        self
    }
}
