//! Working tree checkout for new environments.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::error::EnvironmentSetupError;
use crate::swe::validate_git_ref;
use crate::utils::truncate;

/// Produces a working tree at a revision.
#[async_trait]
pub trait WorkspaceSource: Send + Sync {
    /// Materialise `revision` at `dest`, which must not exist yet.
    async fn checkout(&self, revision: &str, dest: &Path) -> Result<(), EnvironmentSetupError>;
}

/// A local bare mirror of a remote, cloned once and shared by every
/// checkout. Each checkout is an independent clone that borrows the
/// mirror's objects, so environments never share a working tree or index.
pub struct GitMirror {
    remote: String,
    mirror_dir: PathBuf,
    ready: OnceCell<()>,
}

impl GitMirror {
    /// `remote` may be a URL or a path to a local repository.
    pub fn new(remote: impl Into<String>, mirror_dir: impl Into<PathBuf>) -> Self {
        Self {
            remote: remote.into(),
            mirror_dir: mirror_dir.into(),
            ready: OnceCell::new(),
        }
    }

    pub fn mirror_dir(&self) -> &Path {
        &self.mirror_dir
    }

    async fn ensure_mirror(&self) -> Result<(), EnvironmentSetupError> {
        self.ready
            .get_or_try_init(|| async {
                let wrap = |message: String| {
                    EnvironmentSetupError::Workspace(format!("mirror {}: {}", self.remote, message))
                };
                if self.mirror_dir.join("HEAD").exists() {
                    tracing::info!(mirror = %self.mirror_dir.display(), "Updating mirror");
                    git(&self.mirror_dir, &["remote", "update", "--prune"])
                        .await
                        .map_err(wrap)?;
                } else {
                    tracing::info!(remote = %self.remote, mirror = %self.mirror_dir.display(), "Cloning mirror");
                    if let Some(parent) = self.mirror_dir.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    let mirror = self.mirror_dir.to_string_lossy().into_owned();
                    git(Path::new("."), &["clone", "--mirror", "--quiet", &self.remote, &mirror])
                        .await
                        .map_err(wrap)?;
                }
                Ok::<(), EnvironmentSetupError>(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl WorkspaceSource for GitMirror {
    async fn checkout(&self, revision: &str, dest: &Path) -> Result<(), EnvironmentSetupError> {
        validate_git_ref(revision).map_err(|e| EnvironmentSetupError::InvalidInput(e.to_string()))?;
        self.ensure_mirror().await?;

        let checkout_err = |message: String| EnvironmentSetupError::Checkout {
            revision: revision.to_string(),
            message,
        };
        let mirror = self.mirror_dir.to_string_lossy().into_owned();
        let target = dest.to_string_lossy().into_owned();
        git(Path::new("."), &["clone", "--shared", "--no-checkout", "--quiet", &mirror, &target])
            .await
            .map_err(checkout_err)?;
        git(dest, &["checkout", "--quiet", "--force", "--detach", revision])
            .await
            .map_err(checkout_err)?;
        Ok(())
    }
}

/// Run git in `cwd`, returning stdout or a trimmed stderr message.
pub async fn git(cwd: &Path, args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| format!("failed to run git: {}", e))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            truncate(stderr.trim(), 1000)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo(dir: &Path) -> (String, String) {
        git(dir, &["init", "--quiet"]).await.unwrap();
        git(dir, &["config", "user.email", "t@example.com"]).await.unwrap();
        git(dir, &["config", "user.name", "t"]).await.unwrap();
        std::fs::write(dir.join("a.txt"), "one\n").unwrap();
        git(dir, &["add", "."]).await.unwrap();
        git(dir, &["commit", "--quiet", "-m", "one"]).await.unwrap();
        let first = git(dir, &["rev-parse", "HEAD"]).await.unwrap().trim().to_string();
        std::fs::write(dir.join("a.txt"), "two\n").unwrap();
        git(dir, &["commit", "--quiet", "-am", "two"]).await.unwrap();
        let second = git(dir, &["rev-parse", "HEAD"]).await.unwrap().trim().to_string();
        (first, second)
    }

    #[tokio::test]
    async fn test_checkouts_are_independent() {
        let root = tempfile::tempdir().unwrap();
        let upstream = root.path().join("upstream");
        std::fs::create_dir(&upstream).unwrap();
        let (first, second) = init_repo(&upstream).await;

        let mirror = GitMirror::new(upstream.to_string_lossy(), root.path().join("cache/mirror.git"));
        let a = root.path().join("a");
        let b = root.path().join("b");
        mirror.checkout(&first, &a).await.unwrap();
        mirror.checkout(&second, &b).await.unwrap();

        assert_eq!(std::fs::read_to_string(a.join("a.txt")).unwrap(), "one\n");
        assert_eq!(std::fs::read_to_string(b.join("a.txt")).unwrap(), "two\n");

        std::fs::write(a.join("a.txt"), "changed\n").unwrap();
        assert_eq!(std::fs::read_to_string(b.join("a.txt")).unwrap(), "two\n");
    }

    #[tokio::test]
    async fn test_bad_revision_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let upstream = root.path().join("upstream");
        std::fs::create_dir(&upstream).unwrap();
        init_repo(&upstream).await;
        let mirror = GitMirror::new(upstream.to_string_lossy(), root.path().join("m.git"));

        let err = mirror.checkout("--upload-pack=x", &root.path().join("x")).await.unwrap_err();
        assert!(matches!(err, EnvironmentSetupError::InvalidInput(_)));

        let err = mirror
            .checkout(&"f".repeat(40), &root.path().join("y"))
            .await
            .unwrap_err();
        assert!(matches!(err, EnvironmentSetupError::Checkout { .. }));
    }
}
