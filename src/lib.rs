//! pipeforge: a durable pipeline engine for multi-step AI agent runs.
//!
//! A pipeline is an ordered list of agent steps executed against an
//! isolated git worktree of a project. Each step runs an external agent
//! process in a sandboxed container, captures the resulting file changes
//! as a commit, and streams the agent's JSONL transcript into durable
//! storage while the run progresses. Pipelines are idempotent on their
//! inputs and forkable: re-running an identical pipeline finds the
//! previous run, and a modified pipeline reuses the prefix of steps whose
//! definition hash still matches.

// Core modules
pub mod bus;
pub mod cli;
pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod exec;
pub mod identity;
pub mod model;
pub mod repo;
pub mod runtime;
pub mod storage;
pub mod transcript;
pub mod workflows;

// Re-export commonly used error types
pub use error::{ContainerError, ExecError, RepoError};

pub use engine::{PipelineEngine, StartOutcome};
pub use workflows::{PipelineOutcome, StartPipelineCommand};
