//! Environment lifecycle: acquire, scoped use, guaranteed teardown.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::error::{EnvironmentSetupError, ExecError};
use crate::execution::workspace::WorkspaceSource;
use crate::execution::{ExecOutput, ExecRequest, Executor, SandboxHandle};
use crate::swe::{validate_git_ref, RepoProfile};
use crate::utils::tail;

#[derive(Debug, Clone, Default)]
pub struct EnvironmentConfig {
    /// Parent directory for per-environment working trees; the system
    /// temp directory when unset.
    pub root: Option<PathBuf>,
}

impl EnvironmentConfig {
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }
}

/// An isolated checkout at one revision, owned by one evaluation.
pub struct ExecutionEnvironment {
    id: String,
    revision: String,
    workdir: PathBuf,
    handle: SandboxHandle,
    executor: Arc<dyn Executor>,
    env: Vec<(String, String)>,
    dir: Mutex<Option<TempDir>>,
    released: AtomicBool,
}

impl std::fmt::Debug for ExecutionEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEnvironment")
            .field("id", &self.id)
            .field("revision", &self.revision)
            .field("workdir", &self.workdir)
            .field("handle", &self.handle)
            .finish()
    }
}

impl ExecutionEnvironment {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// Host path of the working tree.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Run a command with the profile's environment variables; request
    /// variables win on conflict.
    pub async fn execute(&self, request: ExecRequest) -> Result<ExecOutput, ExecError> {
        if self.is_released() {
            return Err(ExecError::Released(self.id.clone()));
        }
        let mut request = request;
        let mut env = self.env.clone();
        env.retain(|(k, _)| !request.env.iter().any(|(rk, _)| rk == k));
        env.append(&mut request.env);
        request.env = env;
        self.executor.execute(&self.handle, &request).await
    }
}

impl Drop for ExecutionEnvironment {
    fn drop(&mut self) {
        if !self.released.load(Ordering::SeqCst) {
            tracing::warn!(environment = %self.id, "Environment dropped without release");
        }
    }
}

/// Creates and tears down [`ExecutionEnvironment`]s.
pub struct EnvironmentManager {
    executor: Arc<dyn Executor>,
    source: Arc<dyn WorkspaceSource>,
    profile: Arc<RepoProfile>,
    config: EnvironmentConfig,
    active: AtomicUsize,
    released: AtomicUsize,
}

impl EnvironmentManager {
    pub fn new(
        executor: Arc<dyn Executor>,
        source: Arc<dyn WorkspaceSource>,
        profile: Arc<RepoProfile>,
        config: EnvironmentConfig,
    ) -> Self {
        Self {
            executor,
            source,
            profile,
            config,
            active: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    pub fn profile(&self) -> &RepoProfile {
        &self.profile
    }

    /// Environments acquired and not yet released.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Environments torn down so far.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Check out `revision`, start a sandbox over it and run the profile's
    /// install commands. Anything provisioned before a failure is torn down
    /// before the error is returned.
    pub async fn acquire(
        &self,
        id: &str,
        revision: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<ExecutionEnvironment>, EnvironmentSetupError> {
        validate_git_ref(revision).map_err(|e| EnvironmentSetupError::InvalidInput(e.to_string()))?;
        if cancel.is_cancelled() {
            return Err(EnvironmentSetupError::Cancelled);
        }

        let sanitized: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect();
        let prefix = format!("swe-harvest-{}-", sanitized);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.config.root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| EnvironmentSetupError::Workspace(e.to_string()))?;
        let workdir = dir.path().join("repo");

        tokio::select! {
            result = self.source.checkout(revision, &workdir) => result?,
            _ = cancel.cancelled() => return Err(EnvironmentSetupError::Cancelled),
        }

        // Start runs to completion: dropping it midway could orphan a
        // sandbox that nobody holds a handle to.
        let handle = self.executor.start(id, &workdir, &self.profile).await?;
        if cancel.is_cancelled() {
            if let Err(e) = self.executor.stop(&handle).await {
                tracing::warn!(environment = %id, error = %e, "Failed to stop sandbox after cancellation");
            }
            return Err(EnvironmentSetupError::Cancelled);
        }

        self.active.fetch_add(1, Ordering::SeqCst);
        let env = Arc::new(ExecutionEnvironment {
            id: id.to_string(),
            revision: revision.to_string(),
            workdir,
            handle,
            executor: self.executor.clone(),
            env: self
                .profile
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            dir: Mutex::new(Some(dir)),
            released: AtomicBool::new(false),
        });

        if let Err(err) = self.install(&env, cancel).await {
            self.release(&env).await;
            return Err(err);
        }

        tracing::debug!(
            environment = %id,
            revision = %revision,
            executor = %self.executor.kind(),
            "Environment ready"
        );
        Ok(env)
    }

    async fn install(
        &self,
        env: &ExecutionEnvironment,
        cancel: &CancellationToken,
    ) -> Result<(), EnvironmentSetupError> {
        for command in &self.profile.install {
            let request = ExecRequest::new(command.clone(), self.profile.setup_timeout());
            let output = tokio::select! {
                output = env.execute(request) => output?,
                _ = cancel.cancelled() => return Err(EnvironmentSetupError::Cancelled),
            };
            if output.timed_out {
                return Err(EnvironmentSetupError::InstallTimeout {
                    command: command.clone(),
                    seconds: self.profile.setup_timeout_secs,
                });
            }
            if output.exit_code != 0 {
                return Err(EnvironmentSetupError::Install {
                    command: command.clone(),
                    exit_code: output.exit_code,
                    output: tail(&output.combined(), 2000).to_string(),
                });
            }
        }
        Ok(())
    }

    /// Tear `env` down. Only the first call has an effect.
    pub async fn release(&self, env: &ExecutionEnvironment) {
        if env.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.executor.stop(&env.handle).await {
            tracing::warn!(environment = %env.id, error = %e, "Failed to stop sandbox");
        }
        let dir = env
            .dir
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(dir) = dir {
            let path = dir.path().to_path_buf();
            match tokio::task::spawn_blocking(move || dir.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove working tree")
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Working tree cleanup panicked")
                }
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.released.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(environment = %env.id, "Environment released");
    }

    /// Acquire an environment, run `f` with it and release it on every exit
    /// path: success, error, panic and cancellation. A panic in `f` is
    /// resumed after teardown.
    pub async fn with_environment<T, F, Fut>(
        &self,
        id: &str,
        revision: &str,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, EnvironmentSetupError>
    where
        F: FnOnce(Arc<ExecutionEnvironment>) -> Fut,
        Fut: Future<Output = T>,
    {
        let env = self.acquire(id, revision, cancel).await?;
        let work = AssertUnwindSafe(f(env.clone())).catch_unwind();
        let outcome = tokio::select! {
            result = work => Some(result),
            _ = cancel.cancelled() => None,
        };
        self.release(&env).await;
        match outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(panic)) => std::panic::resume_unwind(panic),
            None => Err(EnvironmentSetupError::Cancelled),
        }
    }
}
