//! Isolated execution environments for patch evaluation.
//!
//! An [`Executor`] runs shell commands inside a sandbox whose working tree
//! lives in a per-environment host directory. Two variants exist:
//!
//! - [`LocalExecutor`]: the host toolchain, one temporary working tree per
//!   environment
//! - [`DockerExecutor`]: one container per environment, the working tree
//!   bind-mounted at `/repo`
//!
//! [`EnvironmentManager`] owns checkout, provisioning and teardown; the rest
//! of the harness only sees [`ExecutionEnvironment`].
//!
//! ```text
//! acquire: tempdir → checkout(revision) → executor.start → install
//! release: executor.stop → remove tempdir   (exactly once)
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EnvironmentSetupError, ExecError};
use crate::swe::RepoProfile;

pub mod docker;
pub mod docker_client;
pub mod environment;
pub mod local;
pub mod resources;
pub mod workspace;

pub use docker::DockerExecutor;
pub use docker_client::{DockerClient, SandboxContainer};
pub use environment::{EnvironmentConfig, EnvironmentManager, ExecutionEnvironment};
pub use local::LocalExecutor;
pub use resources::ExecutionLimits;
pub use workspace::{GitMirror, WorkspaceSource};

/// A shell command to run in an environment.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// What a command did. A non-zero exit or a timeout is still an output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    /// The command was killed after exceeding its timeout.
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executor-specific identity of a started sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxHandle {
    Local { workdir: PathBuf },
    Container { id: String, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    #[default]
    Docker,
    Local,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorKind::Docker => write!(f, "docker"),
            ExecutorKind::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(ExecutorKind::Docker),
            "local" => Ok(ExecutorKind::Local),
            other => Err(format!("unknown executor: {}", other)),
        }
    }
}

/// Runs commands in sandboxes.
#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    /// Start a sandbox over the checked-out tree at `workdir`.
    async fn start(
        &self,
        name: &str,
        workdir: &Path,
        profile: &RepoProfile,
    ) -> Result<SandboxHandle, EnvironmentSetupError>;

    /// Run one command. On timeout the whole process group is killed and
    /// the output captured so far is returned with `timed_out` set.
    async fn execute(
        &self,
        handle: &SandboxHandle,
        request: &ExecRequest,
    ) -> Result<ExecOutput, ExecError>;

    async fn stop(&self, handle: &SandboxHandle) -> Result<(), ExecError>;
}
