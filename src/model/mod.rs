//! Core domain types for the pipeline engine.
//!
//! Everything that crosses a service boundary or is persisted lives here:
//! projects and pipeline definitions, runs and their per-step results, and
//! the parsed AI activity records derived from agent transcripts.

mod activity;
mod project;
mod run;
mod step;

pub use activity::AiActivityRecord;
pub use project::{PipelineDefinition, Project};
pub use run::{PipelineRun, RunStatus};
pub use step::{AgentConfig, FlagFormat, StepDefinition, StepResult, StepStatus, TokenUsage};

/// Builds the step-scoped task id (`<run_id>-<step_id>`) used to correlate
/// AI activity records with the step that produced them.
pub fn task_id(run_id: &str, step_id: &str) -> String {
    if step_id.is_empty() {
        run_id.to_string()
    } else {
        format!("{}-{}", run_id, step_id)
    }
}
