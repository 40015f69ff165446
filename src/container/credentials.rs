//! Best-effort injection of host AI-tool credentials into a run container.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::transcript::ToolAdapter;

use super::ContainerService;

/// Copies the adapter's host credential file into the container.
///
/// Best-effort by design: a missing host file or a failed write is logged
/// and skipped, never failing setup. Containers without credentials fail
/// later, inside the step, where the agent output explains why.
pub async fn inject_tool_credentials(
    containers: &dyn ContainerService,
    container_id: &str,
    adapter: &dyn ToolAdapter,
) {
    let Some((host_path, container_path)) = adapter.credential_file() else {
        debug!(source = adapter.source(), "adapter has no credential file");
        return;
    };

    let content = match std::fs::read(&host_path) {
        Ok(content) => content,
        Err(err) => {
            debug!(
                source = adapter.source(),
                path = %host_path.display(),
                error = %err,
                "no host credentials to inject"
            );
            return;
        }
    };

    if let Err(err) = containers
        .write_file(container_id, &container_path, &content)
        .await
    {
        warn!(
            source = adapter.source(),
            container_id,
            error = %err,
            "failed to inject credentials"
        );
    } else {
        debug!(
            source = adapter.source(),
            container_id,
            path = %container_path.display(),
            "injected credentials"
        );
    }
}

/// Resolves a path under the invoking user's home directory.
pub(crate) fn home_path(relative: &str) -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(relative))
}
