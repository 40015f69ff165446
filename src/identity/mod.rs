//! Deterministic identity for pipelines, steps, and run task queues.
//!
//! Everything here must stay byte-stable across releases: the fingerprints
//! drive replay detection and fork-prefix matching, and the queue namer
//! addresses in-flight run workers.

mod fingerprint;
mod queue;
mod substitute;

pub use fingerprint::{canonical_json, pipeline_identity_hash, step_definition_hash};
pub use queue::{run_task_queue, slugify, ORCHESTRATOR_QUEUE};
pub use substitute::{compose_prompt, substitute_runtime_vars, RuntimeVars};
