//! Container-per-environment executor.
//!
//! The environment's host working tree is bind-mounted at `/repo` and the
//! container idles on `sleep infinity`; every command is a `docker exec`.
//! Commands run as the leader of a fresh session whose id is recorded in a
//! pid file, so a timeout can kill the whole process group in-container.

use std::path::Path;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{DockerError, EnvironmentSetupError, ExecError};
use crate::execution::docker_client::{CapturedOutput, DockerClient, SandboxContainer};
use crate::execution::resources::ExecutionLimits;
use crate::execution::{ExecOutput, ExecRequest, Executor, ExecutorKind, SandboxHandle};
use crate::swe::RepoProfile;

/// Mount point of the working tree inside the container.
pub const CONTAINER_WORKDIR: &str = "/repo";

/// Runs `$1` as a session leader, records its pid in `$2` and exits with
/// its status.
const EXEC_WRAPPER: &str = r#"setsid sh -c "$1" & pid=$!; echo "$pid" > "$2"; wait "$pid"; status=$?; rm -f "$2"; exit "$status""#;

pub struct DockerExecutor {
    client: DockerClient,
}

impl DockerExecutor {
    pub fn new(client: DockerClient) -> Self {
        Self { client }
    }

    /// Connect to the local daemon and check it answers.
    pub async fn connect() -> Result<Self, DockerError> {
        let client = DockerClient::new()?;
        client.ping().await?;
        Ok(Self::new(client))
    }

    async fn ensure_image(&self, image: &str) -> Result<(), EnvironmentSetupError> {
        if self.client.image_exists(image).await {
            return Ok(());
        }
        tracing::info!(image = %image, "Pulling image");
        self.client
            .pull_image(image)
            .await
            .map_err(|e| EnvironmentSetupError::MissingImage {
                image: image.to_string(),
                message: e.to_string(),
            })
    }

    async fn kill_session(&self, id: &str, pid_file: &str) {
        let script = format!(
            "test -f {f} && kill -KILL -- -$(cat {f}) 2>/dev/null; rm -f {f}; true",
            f = pid_file
        );
        if let Err(e) = self.client.exec_quiet(id, &script).await {
            tracing::warn!(container = %id, error = %e, "Failed to kill timed out command");
        }
    }
}

/// Container names only allow `[a-zA-Z0-9_.-]`.
pub fn container_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("swe-harvest-{}-{}", cleaned, &Uuid::new_v4().simple().to_string()[..8])
}

#[async_trait]
impl Executor for DockerExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Docker
    }

    async fn start(
        &self,
        name: &str,
        workdir: &Path,
        profile: &RepoProfile,
    ) -> Result<SandboxHandle, EnvironmentSetupError> {
        let image = profile.image.clone().ok_or_else(|| EnvironmentSetupError::MissingImage {
            image: String::new(),
            message: format!("profile for {} sets no image", profile.repo),
        })?;
        self.ensure_image(&image).await?;

        let name = container_name(name);
        let sandbox = SandboxContainer::new(&name, &image, workdir, CONTAINER_WORKDIR)
            .with_env(&profile.env)
            .with_limits(ExecutionLimits::for_profile(profile))
            .with_network(profile.network);
        let id = self
            .client
            .launch(&sandbox)
            .await
            .map_err(|e| EnvironmentSetupError::Provision(e.to_string()))?;

        tracing::debug!(container = %name, image = %image, "Container started");
        Ok(SandboxHandle::Container { id, name })
    }

    async fn execute(
        &self,
        handle: &SandboxHandle,
        request: &ExecRequest,
    ) -> Result<ExecOutput, ExecError> {
        let SandboxHandle::Container { id, .. } = handle else {
            return Err(ExecError::Spawn {
                command: request.command.clone(),
                message: "docker executor given a local handle".to_string(),
            });
        };

        let pid_file = format!("/tmp/swe-harvest-{}.pid", Uuid::new_v4().simple());
        let env: Vec<String> = request
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let cmd = ["sh", "-c", EXEC_WRAPPER, "sh", request.command.as_str(), pid_file.as_str()];

        let mut captured = CapturedOutput::default();
        let waited = tokio::time::timeout(
            request.timeout,
            self.client.exec(id, &cmd, &env, &mut captured),
        )
        .await;
        let CapturedOutput { stdout, stderr } = captured;

        match waited {
            Ok(Ok(exit_code)) => Ok(ExecOutput {
                exit_code,
                stdout,
                stderr,
                timed_out: false,
            }),
            Ok(Err(e)) => Err(ExecError::Docker(e)),
            Err(_) => {
                tracing::warn!(
                    container = %id,
                    command = %request.command,
                    timeout_secs = request.timeout.as_secs(),
                    "Command timed out, killing process group"
                );
                self.kill_session(id, &pid_file).await;
                Ok(ExecOutput {
                    exit_code: -1,
                    stdout,
                    stderr,
                    timed_out: true,
                })
            }
        }
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<(), ExecError> {
        let SandboxHandle::Container { id, name } = handle else {
            return Ok(());
        };
        // Files written as root through the bind mount must stay removable
        // by the host user.
        let chmod = format!("chmod -R a+rwX {} 2>/dev/null; true", CONTAINER_WORKDIR);
        if let Err(e) = self.client.exec_quiet(id, &chmod).await {
            tracing::debug!(container = %name, error = %e, "Could not relax working tree permissions");
        }
        match self.client.remove(id).await {
            Ok(()) | Err(DockerError::ContainerNotFound { .. }) => {
                tracing::debug!(container = %name, "Container removed");
                Ok(())
            }
            Err(e) => Err(ExecError::Docker(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_container_name_is_sanitised_and_unique() {
        let a = container_name("octo__widgets-42/agent");
        let b = container_name("octo__widgets-42/agent");
        assert!(a.starts_with("swe-harvest-octo__widgets-42-agent-"));
        assert_ne!(a, b);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')));
    }

    #[tokio::test]
    #[ignore = "requires a running Docker daemon"]
    async fn test_container_timeout_kills_group() {
        let executor = DockerExecutor::connect().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut profile = RepoProfile::from_yaml("repo: o/r\n").unwrap();
        profile.image = Some("alpine:3".to_string());
        let handle = executor.start("timeout-test", dir.path(), &profile).await.unwrap();

        let out = executor
            .execute(
                &handle,
                &ExecRequest::new("echo started; sleep 60", Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(out.stdout.contains("started"));

        let ps = executor
            .execute(&handle, &ExecRequest::new("ps -o args | grep -c '[s]leep 60' || true", Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(ps.stdout.trim(), "0");
        executor.stop(&handle).await.unwrap();
    }
}
