//! Task-queue naming.
//!
//! The run worker inside each run's container serves a queue whose name is
//! derived deterministically from the run, so setup, steps and
//! observability all address the same worker. Changing this derivation is
//! a breaking change: in-flight runs would be orphaned.

/// Queue served by the shared orchestrator worker.
pub const ORCHESTRATOR_QUEUE: &str = "orchestrator-queue";

/// Maximum length of the slug portion of a run queue name.
const MAX_SLUG_LEN: usize = 50;

/// Fallback slug for names that sanitise to nothing.
const FALLBACK_SLUG: &str = "task";

/// Sanitises a human-readable name into a queue-safe slug: lowercase
/// ASCII alphanumerics, hyphen-delimited, at most 50 chars, no leading or
/// trailing hyphens, never empty.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_hyphen = true; // suppress leading hyphens

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }

    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
    }
    while slug.ends_with('-') {
        slug.pop();
    }

    if slug.is_empty() {
        FALLBACK_SLUG.to_string()
    } else {
        slug
    }
}

/// Returns the name of the run-scoped task queue for a run.
pub fn run_task_queue(run_name: &str, run_id: &str) -> String {
    format!("task-queue-{}-{}", slugify(run_name), run_id)
}
