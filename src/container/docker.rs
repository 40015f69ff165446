//! Container service backed by the Docker API via bollard.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use tracing::{debug, info};

use crate::error::ContainerError;

use super::{ContainerService, ContainerSpec};

/// Docker-backed container service.
pub struct DockerContainers {
    docker: Docker,
}

impl DockerContainers {
    /// Connects to the local Docker daemon.
    pub fn new() -> Result<Self, ContainerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ContainerError::DaemonUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Wraps an existing bollard client.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    fn is_not_found(err: &bollard::errors::Error) -> bool {
        matches!(
            err,
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }
        )
    }
}

#[async_trait]
impl ContainerService for DockerContainers {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        // Idempotent restart: reuse an existing container with this label
        // set rather than creating a duplicate.
        let existing = self.list_by_labels(&spec.labels).await?;
        if let Some(id) = existing.into_iter().next() {
            info!(container_id = %id, name = %spec.name, "reusing existing container");
            return Ok(id);
        }

        let host_config = HostConfig {
            memory: Some(spec.limits.memory_bytes()),
            cpu_period: Some(spec.limits.cpu_period()),
            cpu_quota: Some(spec.limits.cpu_quota()),
            pids_limit: Some(spec.limits.max_processes as i64),
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            working_dir: Some(spec.workspace.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| ContainerError::CreateFailed(e.to_string()))?;

        debug!(container_id = %response.id, name = %spec.name, "created container");
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), ContainerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ContainerError::OperationFailed {
                op: "start".to_string(),
                reason: e.to_string(),
            })
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), ContainerError> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(ContainerError::OperationFailed {
                op: "stop".to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn delete(&self, id: &str, force: bool) -> Result<(), ContainerError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(ContainerError::OperationFailed {
                op: "delete".to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn kill(&self, id: &str) -> Result<(), ContainerError> {
        match self
            .docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(ContainerError::OperationFailed {
                op: "kill".to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn write_file(
        &self,
        id: &str,
        path: &Path,
        content: &[u8],
    ) -> Result<(), ContainerError> {
        // The upload API takes a tar archive extracted at the given path.
        let relative = path
            .strip_prefix("/")
            .map_err(|_| ContainerError::WriteFailed(format!("path {} not absolute", path.display())))?;

        let mut archive = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        archive
            .append_data(&mut header, relative, content)
            .map_err(|e| ContainerError::WriteFailed(e.to_string()))?;
        let body = archive
            .into_inner()
            .map_err(|e| ContainerError::WriteFailed(e.to_string()))?;

        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), body.into())
            .await
            .map_err(|e| ContainerError::WriteFailed(e.to_string()))
    }

    async fn list_by_labels(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<String>, ContainerError> {
        let label_filters: Vec<String> = labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), label_filters);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| ContainerError::OperationFailed {
                op: "list".to_string(),
                reason: e.to_string(),
            })?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}
