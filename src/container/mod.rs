//! Container service.
//!
//! Each run gets one container hosting its run worker and the agent
//! binary, with the run's worktree bind-mounted read-write at the
//! workspace path. All operations are idempotent: creating a container
//! whose label set already exists returns the existing one, and deleting
//! an absent container is success — that is what makes compensations and
//! restarts safe.

mod credentials;
mod docker;

pub use credentials::inject_tool_credentials;
pub(crate) use credentials::home_path;
pub use docker::DockerContainers;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ContainerError;

/// Label identifying the engine's containers.
pub const MANAGED_BY_LABEL: &str = "pipeforge.managed";
/// Label carrying the run id on a run's container.
pub const RUN_ID_LABEL: &str = "pipeforge.run-id";

/// Resource limits applied to a run container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// CPU cores available (e.g. 0.5, 1.0, 2.0).
    pub cpu_cores: f64,
    /// Maximum number of processes.
    pub max_processes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpu_cores: 2.0,
            max_processes: 256,
        }
    }
}

impl ResourceLimits {
    /// Memory limit in bytes.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    /// CPU period in microseconds (fixed at 100ms).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// CPU quota derived from the allocated cores.
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_period() as f64 * self.cpu_cores) as i64
    }
}

/// Configuration for creating a run container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image to run.
    pub image: String,
    /// Command the container runs (the run worker).
    pub command: Vec<String>,
    /// Workspace path inside the container.
    pub workspace: String,
    /// Bind mounts in `host:container[:mode]` form.
    pub binds: Vec<String>,
    /// Environment variables in `KEY=value` form.
    pub env: Vec<String>,
    /// Labels identifying the run.
    pub labels: HashMap<String, String>,
    /// Resource limits.
    pub limits: ResourceLimits,
}

impl ContainerSpec {
    /// Creates a spec with the given name and image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), "true".to_string());
        Self {
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            workspace: "/workspace".to_string(),
            binds: Vec::new(),
            env: Vec::new(),
            labels,
            limits: ResourceLimits::default(),
        }
    }

    /// Sets the command.
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Sets the in-container workspace path.
    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// Adds a read-write bind mount.
    pub fn with_bind(mut self, host: &Path, container: &str) -> Self {
        self.binds.push(format!("{}:{}", host.display(), container));
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{}={}", key, value));
        self
    }

    /// Adds a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Sets the resource limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Container lifecycle operations the engine consumes.
#[async_trait]
pub trait ContainerService: Send + Sync {
    /// Creates a container. When a container with the same label set
    /// already exists, its id is returned instead.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError>;

    /// Starts a container.
    async fn start(&self, id: &str) -> Result<(), ContainerError>;

    /// Stops a container, waiting up to `timeout` before a hard kill.
    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), ContainerError>;

    /// Deletes a container. An absent container is success.
    async fn delete(&self, id: &str, force: bool) -> Result<(), ContainerError>;

    /// Kills a container immediately.
    async fn kill(&self, id: &str) -> Result<(), ContainerError>;

    /// Writes a file into a running container.
    async fn write_file(
        &self,
        id: &str,
        path: &Path,
        content: &[u8],
    ) -> Result<(), ContainerError>;

    /// Lists container ids matching every given label.
    async fn list_by_labels(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<String>, ContainerError>;
}
