//! Host-toolchain executor.
//!
//! Each command runs under `sh -c` in its own process group with the
//! environment's working tree as current directory. A timeout, or dropping
//! the in-flight future, kills the whole group.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::error::{EnvironmentSetupError, ExecError};
use crate::execution::{ExecOutput, ExecRequest, Executor, ExecutorKind, SandboxHandle};
use crate::swe::RepoProfile;

/// How long output may keep streaming once the shell has exited.
const PIPE_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

/// Kills a process group when dropped unless disarmed.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

fn kill_process_group(pgid: u32) {
    let result = std::process::Command::new("kill")
        .args(["-KILL", "--", &format!("-{}", pgid)])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        tracing::warn!(pgid = pgid, error = %e, "Failed to kill process group");
    }
}

/// Append everything `reader` yields to `buf`. Each chunk is committed as
/// soon as it is read, so cancelling keeps what arrived.
async fn drain<R: AsyncRead + Unpin>(reader: Option<R>, buf: &mut Vec<u8>) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Local
    }

    async fn start(
        &self,
        _name: &str,
        workdir: &Path,
        _profile: &RepoProfile,
    ) -> Result<SandboxHandle, EnvironmentSetupError> {
        if !workdir.is_dir() {
            return Err(EnvironmentSetupError::Provision(format!(
                "working tree {} does not exist",
                workdir.display()
            )));
        }
        Ok(SandboxHandle::Local {
            workdir: workdir.to_path_buf(),
        })
    }

    async fn execute(
        &self,
        handle: &SandboxHandle,
        request: &ExecRequest,
    ) -> Result<ExecOutput, ExecError> {
        let SandboxHandle::Local { workdir } = handle else {
            return Err(ExecError::Spawn {
                command: request.command.clone(),
                message: "local executor given a container handle".to_string(),
            });
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(workdir)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ExecError::Spawn {
            command: request.command.clone(),
            message: e.to_string(),
        })?;
        let mut guard = ProcessGroupGuard { pgid: child.id() };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();

        let waited = {
            let run = async {
                let drains = async {
                    tokio::join!(drain(stdout, &mut out_buf), drain(stderr, &mut err_buf));
                };
                tokio::pin!(drains);
                tokio::select! {
                    _ = &mut drains => child.wait().await.map(|status| (status, true)),
                    status = child.wait() => {
                        // A background process left behind can hold the pipes
                        // open long after the shell itself has exited.
                        let drained = tokio::time::timeout(PIPE_GRACE, &mut drains).await.is_ok();
                        status.map(|status| (status, drained))
                    }
                }
            };
            tokio::time::timeout(request.timeout, run).await
        };

        let (exit_code, timed_out) = match waited {
            Ok(Ok((status, drained))) => {
                if drained {
                    guard.disarm();
                } else {
                    tracing::debug!(
                        command = %request.command,
                        "Output still open after exit, killing process group"
                    );
                    guard.kill();
                }
                (status.code().map(i64::from).unwrap_or(-1), false)
            }
            Ok(Err(e)) => {
                guard.kill();
                return Err(ExecError::Io(e));
            }
            Err(_) => {
                tracing::warn!(
                    command = %request.command,
                    timeout_secs = request.timeout.as_secs(),
                    "Command timed out, killing process group"
                );
                guard.kill();
                let _ = child.kill().await;
                (-1, true)
            }
        };

        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&out_buf).into_owned(),
            stderr: String::from_utf8_lossy(&err_buf).into_owned(),
            timed_out,
        })
    }

    async fn stop(&self, _handle: &SandboxHandle) -> Result<(), ExecError> {
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    async fn run(dir: &Path, command: &str, timeout: Duration) -> ExecOutput {
        let handle = SandboxHandle::Local {
            workdir: dir.to_path_buf(),
        };
        LocalExecutor::new()
            .execute(&handle, &ExecRequest::new(command, timeout))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_runs_in_workdir_with_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let handle = SandboxHandle::Local {
            workdir: dir.path().to_path_buf(),
        };
        let out = LocalExecutor::new()
            .execute(
                &handle,
                &ExecRequest::new("cat marker.txt; echo \" $GREETING\"; exit 3", Duration::from_secs(10))
                    .with_env("GREETING", "hi"),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, "here hi\n");
        assert_eq!(out.exit_code, 3);
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output_and_kills_group() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let out = run(
            dir.path(),
            "echo started; (sleep 30; touch late.txt) & sleep 30",
            Duration::from_millis(500),
        )
        .await;
        assert!(out.timed_out);
        assert!(out.stdout.contains("started"));
        assert!(started.elapsed() < Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!dir.path().join("late.txt").exists());
    }

    #[tokio::test]
    async fn test_background_child_does_not_hold_a_finished_command() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let out = run(dir.path(), "sleep 30 & echo done", Duration::from_secs(10)).await;
        assert!(!out.timed_out);
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.contains("done"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_start_requires_existing_tree() {
        let dir = tempfile::tempdir().unwrap();
        let profile = RepoProfile::from_yaml("repo: o/r\n").unwrap();
        let missing = dir.path().join("missing");
        assert!(LocalExecutor::new().start("x", &missing, &profile).await.is_err());
        assert!(LocalExecutor::new().start("x", dir.path(), &profile).await.is_ok());
    }
}
