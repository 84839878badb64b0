//! Thin bollard wrapper covering what sandboxes need: an idle container over
//! a bind-mounted working tree, shell execs into it and forced removal.

use std::path::{Path, PathBuf};

use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;

use crate::error::DockerError;
use crate::execution::resources::ExecutionLimits;

/// An idle container whose only job is to host `docker exec` calls against
/// a working tree mounted from the host.
#[derive(Debug, Clone)]
pub struct SandboxContainer {
    pub name: String,
    pub image: String,
    pub host_workdir: PathBuf,
    pub mount_point: String,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub limits: ExecutionLimits,
    pub network: bool,
}

impl SandboxContainer {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        host_workdir: &Path,
        mount_point: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            host_workdir: host_workdir.to_path_buf(),
            mount_point: mount_point.into(),
            env: Vec::new(),
            limits: ExecutionLimits::default(),
            network: false,
        }
    }

    pub fn with_env<'a>(mut self, vars: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        self.env = vars.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_network(mut self, enabled: bool) -> Self {
        self.network = enabled;
        self
    }

    fn bind(&self) -> String {
        format!("{}:{}", self.host_workdir.display(), self.mount_point)
    }

    fn host_config(&self) -> HostConfig {
        let cpu_quota = self.limits.cpu_quota();
        HostConfig {
            memory: Some(self.limits.memory_bytes()),
            cpu_period: (cpu_quota > 0).then(|| self.limits.cpu_period()),
            cpu_quota: (cpu_quota > 0).then_some(cpu_quota),
            pids_limit: Some(self.limits.max_processes as i64),
            network_mode: Some(if self.network { "bridge" } else { "none" }.to_string()),
            binds: Some(vec![self.bind()]),
            ..Default::default()
        }
    }
}

/// Output of one exec, accumulated while it streams so that a caller that
/// stops waiting still has what arrived.
#[derive(Debug, Default, Clone)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connect using the local defaults (`DOCKER_HOST` or the unix socket).
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(format!("Failed to connect: {e}")))?;
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<(), DockerError> {
        self.docker
            .ping()
            .await
            .map_err(|e| DockerError::DaemonUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    pub async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            step.map_err(|e| DockerError::ImagePull(format!("{image}: {e}")))?;
        }
        Ok(())
    }

    /// Create and start `sandbox` idling on `sleep infinity`. Returns the
    /// container id; a container that fails to start is removed again.
    pub async fn launch(&self, sandbox: &SandboxContainer) -> Result<String, DockerError> {
        let config = Config {
            image: Some(sandbox.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: (!sandbox.env.is_empty()).then(|| sandbox.env.clone()),
            working_dir: Some(sandbox.mount_point.clone()),
            host_config: Some(sandbox.host_config()),
            tty: Some(false),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: sandbox.name.clone(),
            platform: None,
        };
        let id = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to create container: {e}")))?
            .id;

        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(cleanup) = self.remove(&id).await {
                tracing::warn!(container = %sandbox.name, error = %cleanup, "Failed to remove container after start failure");
            }
            return Err(DockerError::RunFailed(format!("Failed to start container: {e}")));
        }
        Ok(id)
    }

    /// Force-remove a container and its anonymous volumes.
    pub async fn remove(&self, id: &str) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| {
                if e.to_string().contains("No such container") {
                    DockerError::ContainerNotFound { id: id.to_string() }
                } else {
                    DockerError::RunFailed(format!("Failed to remove container: {e}"))
                }
            })
    }

    /// Run `argv` in the container, appending to `captured` as chunks
    /// arrive. Returns the exit code, `-1` when the daemon reports none.
    pub async fn exec(
        &self,
        id: &str,
        argv: &[&str],
        env: &[String],
        captured: &mut CapturedOutput,
    ) -> Result<i64, DockerError> {
        let options = CreateExecOptions {
            cmd: Some(argv.iter().map(|s| s.to_string()).collect()),
            env: (!env.is_empty()).then(|| env.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to create exec: {e}")))?;
        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to start exec: {e}")))?;

        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        captured.stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        captured.stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Err(DockerError::RunFailed(format!("Error reading output: {e}")))
                    }
                }
            }
        }

        let info = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to inspect exec: {e}")))?;
        Ok(info.exit_code.unwrap_or(-1))
    }

    /// Run a shell snippet whose output nobody needs.
    pub async fn exec_quiet(&self, id: &str, script: &str) -> Result<i64, DockerError> {
        let mut ignored = CapturedOutput::default();
        self.exec(id, &["sh", "-c", script], &[], &mut ignored).await
    }
}
