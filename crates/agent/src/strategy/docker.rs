//! Containerized builds through the docker CLI
//!
//! Each build gets a fresh container created from the configured image. The
//! staged working directory is copied to `/build` inside it, the script runs
//! attached, and the container is removed afterwards whatever the outcome.
//! Forced stops go through `docker kill` instead of host signals.

use async_trait::async_trait;
use buildq_common::config::DockerConfig;
use buildq_common::Job;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{run_checked, ExecutionStrategy};
use crate::error::{AgentError, AgentResult};
use crate::log_sink::OutputSink;
use crate::script::SCRIPT_NAME;
use crate::supervisor::{supervise, Limits};
use crate::terminator::Terminator;

/// Build directory inside the container
pub const CONTAINER_BUILD_DIR: &str = "/build";

/// Runs each build in its own docker container
#[derive(Debug, Clone)]
pub struct ContainerStrategy {
    image: String,
    allow_user_images: bool,
}

impl ContainerStrategy {
    /// Create the strategy, failing if the default image is not available locally
    pub async fn new(config: &DockerConfig) -> AgentResult<Self> {
        match run_docker(&["image", "inspect", config.image.as_str()]).await {
            Ok(_) => {}
            Err(AgentError::Spawn { source, .. }) => {
                return Err(AgentError::Config(format!(
                    "docker is not available: {}",
                    source
                )))
            }
            Err(_) => {
                return Err(AgentError::Config(format!(
                    "docker image '{}' not found; pull it before starting the worker",
                    config.image
                )))
            }
        }

        info!(image = %config.image, "Using docker execution");
        Ok(Self {
            image: config.image.clone(),
            allow_user_images: config.allow_user_images,
        })
    }

    /// Image for a job plus a warning line when the job's request is ignored
    pub fn select_image(&self, job: &Job) -> (String, Option<String>) {
        match job.image.as_deref().filter(|image| !image.trim().is_empty()) {
            Some(image) if self.allow_user_images => (image.to_string(), None),
            Some(image) => (
                self.image.clone(),
                Some(format!(
                    "Warning: job requested image '{}' but user images are not allowed on this worker; using '{}'\n",
                    image, self.image
                )),
            ),
            None => (self.image.clone(), None),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for ContainerStrategy {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn working_dir(&self, _staged: &Path) -> PathBuf {
        PathBuf::from(CONTAINER_BUILD_DIR)
    }

    async fn run(
        &self,
        job: &Job,
        script: &Path,
        sink: &dyn OutputSink,
        limits: Limits,
        shutdown: &CancellationToken,
    ) -> AgentResult<i32> {
        let (image, warning) = self.select_image(job);
        if let Some(warning) = warning {
            warn!(job_id = %job.job_id, "Ignoring job image request");
            sink.write_str(&warning);
        }

        let work_dir = script
            .parent()
            .ok_or_else(|| AgentError::Docker(format!("script {} has no parent", script.display())))?;
        let container_script = format!("{}/{}", CONTAINER_BUILD_DIR, SCRIPT_NAME);

        let container_id = run_docker(&[
            "create",
            "--workdir",
            CONTAINER_BUILD_DIR,
            image.as_str(),
            "bash",
            container_script.as_str(),
        ])
        .await?;
        debug!(job_id = %job.job_id, container = %container_id, %image, "Created build container");

        let result = self
            .run_in_container(&container_id, work_dir, sink, limits, shutdown)
            .await;

        if let Err(e) = run_docker(&["rm", "-f", container_id.as_str()]).await {
            warn!(container = %container_id, error = %e, "Failed to remove build container");
        }

        result
    }
}

impl ContainerStrategy {
    async fn run_in_container(
        &self,
        container_id: &str,
        work_dir: &Path,
        sink: &dyn OutputSink,
        limits: Limits,
        shutdown: &CancellationToken,
    ) -> AgentResult<i32> {
        let source = format!("{}/.", work_dir.display());
        let destination = format!("{}:{}", container_id, CONTAINER_BUILD_DIR);
        run_docker(&["cp", source.as_str(), destination.as_str()]).await?;

        let mut command = Command::new("docker");
        command.args(["start", "--attach", container_id]);

        let terminator = ContainerTerminator::new(container_id);
        let result = supervise(command, sink, limits, &terminator, shutdown).await?;
        Ok(result.exit_code)
    }
}

/// Stops a build by killing its container; removal is left to the strategy
#[derive(Debug, Clone)]
pub struct ContainerTerminator {
    container_id: String,
}

impl ContainerTerminator {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
        }
    }
}

#[async_trait]
impl Terminator for ContainerTerminator {
    async fn terminate(&self, _pid: Option<u32>) {
        if let Err(e) = run_docker(&["kill", self.container_id.as_str()]).await {
            warn!(container = %self.container_id, error = %e, "Failed to kill build container");
        }
    }
}

/// Run a docker CLI command and return its trimmed stdout
async fn run_docker(args: &[&str]) -> AgentResult<String> {
    let output = run_checked("docker", args).await.map_err(|e| match e {
        AgentError::CommandFailed { command, message } => {
            AgentError::Docker(format!("{}: {}", command, message))
        }
        other => other,
    })?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
