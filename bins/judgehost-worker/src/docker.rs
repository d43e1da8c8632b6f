// Container runtime adapter using Bollard
//
// The pipeline and the guard only see the `ContainerRuntime` trait. In-container
// commands write their stdout/stderr into the mounted working directory, so no
// output stream is consumed here beyond draining it to detect completion.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// In-container mount point of the task working directory.
pub const SANDBOX_ROOT: &str = "/sandbox";

/// Process ceiling per sandbox, bounds fork bombs.
pub const PIDS_LIMIT: i64 = 64;

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Everything needed to create one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    /// Host directory bind-mounted at [`SANDBOX_ROOT`].
    pub workdir: PathBuf,
    pub cpu: usize,
    /// Bytes.
    pub memory: i64,
    pub pids_limit: i64,
    pub user: String,
}

/// The subset of container state the core cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerState {
    /// Host-visible pid of the container's root process, if it is running.
    pub pid: Option<u32>,
    pub running: bool,
    pub oom_killed: bool,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &SandboxSpec) -> Result<String>;
    async fn start(&self, id: &str) -> Result<()>;
    /// Runs `/bin/bash -c <cmd>` inside the sandbox and blocks until it exits.
    /// The returned exit code is diagnostic only.
    async fn exec(&self, id: &str, user: &str, cmd: &str) -> Result<i64>;
    async fn inspect(&self, id: &str) -> Result<ContainerState>;
    /// Stopping an already stopped or missing container succeeds.
    async fn stop(&self, id: &str) -> Result<()>;
    /// Removing a missing container succeeds.
    async fn remove(&self, id: &str) -> Result<()>;
    async fn ping(&self) -> Result<()>;
}

pub struct DockerRuntime {
    docker: Docker,
}

fn is_status(err: &bollard::errors::Error, codes: &[u16]) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. }
            if codes.contains(status_code)
    )
}

impl DockerRuntime {
    /// Connect to the engine named by `server`, or the local defaults when it is empty.
    pub fn connect(server: &str) -> Result<Self> {
        let connected = if server.is_empty() {
            Docker::connect_with_local_defaults()
        } else if let Some(path) = server.strip_prefix("unix://") {
            Docker::connect_with_unix(path, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
        } else {
            let addr = server.replacen("tcp://", "http://", 1);
            Docker::connect_with_http(&addr, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
        };
        let docker = connected.with_context(|| format!("Failed to connect to Docker daemon at '{}'", server))?;

        Ok(Self { docker })
    }

    /// Pull `image` unless it is already present.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling now");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }

        info!(image, "Image pulled successfully");
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<String> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["/bin/bash".to_string()]),
            tty: Some(true),
            working_dir: Some(SANDBOX_ROOT.to_string()),
            user: Some(spec.user.clone()),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}", spec.workdir.display(), SANDBOX_ROOT)]),
                cpuset_cpus: Some(spec.cpu.to_string()),
                memory: Some(spec.memory),
                memory_swap: Some(spec.memory),
                pids_limit: Some(spec.pids_limit),
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(options), config)
            .await
            .context("Failed to create Docker container")?;
        for warning in &container.warnings {
            warn!(container = %container.id, warning = %warning, "Container created with warning");
        }
        Ok(container.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")
    }

    async fn exec(&self, id: &str, user: &str, cmd: &str) -> Result<i64> {
        let exec_config = CreateExecOptions {
            cmd: Some(vec!["/bin/bash", "-c", cmd]),
            user: Some(user),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(id, exec_config)
            .await
            .context("Failed to create exec")?;

        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };
        let output = self
            .docker
            .start_exec(&exec.id, Some(start_config))
            .await
            .context("Failed to start exec")?;

        // Completion is signalled by the end of the attached stream
        if let StartExecResults::Attached { mut output, .. } = output {
            while let Some(msg) = output.next().await {
                if let Err(e) = msg {
                    warn!(exec = %exec.id, error = %e, "Exec stream broke before completion");
                    break;
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .context("Failed to inspect exec")?;
        Ok(inspect.exit_code.unwrap_or(-1))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect Docker container")?;
        let state = response.state.unwrap_or_default();
        Ok(ContainerState {
            pid: state.pid.filter(|pid| *pid > 0).map(|pid| pid as u32),
            running: state.running.unwrap_or(false),
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    async fn stop(&self, id: &str) -> Result<()> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: 1 }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: never existed or already removed
            Err(e) if is_status(&e, &[304, 404]) => {
                debug!(container = id, "Container already stopped");
                Ok(())
            }
            Err(e) => Err(e).context("Failed to stop Docker container"),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, &[404]) => {
                debug!(container = id, "Container already removed");
                Ok(())
            }
            Err(e) => Err(e).context("Failed to remove Docker container"),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .context("ping docker server error")?;
        Ok(())
    }
}
