//! External CLI agent.
//!
//! The command runs inside the environment with the working tree as its
//! current directory. Whatever it leaves changed in the tree, relative to
//! the checked-out base commit, is the candidate patch.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{AgentError, CandidatePatch, PatchAgent};
use crate::execution::workspace::git;
use crate::execution::{ExecRequest, ExecutionEnvironment};
use crate::swe::input_validation::shell_quote;
use crate::swe::CodingAgentDataPoint;
use crate::utils::tail;

/// Replaced by the shell-quoted problem statement.
pub const PROBLEM_PLACEHOLDER: &str = "{problem}";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const LOG_TAIL: usize = 4_000;

/// Runs a command-line agent such as `claude -p {problem}`.
///
/// Besides the placeholder, the problem is exposed to the command through
/// `SWE_PROBLEM_STATEMENT`, together with `SWE_INSTANCE_ID`, `SWE_REPO`,
/// `SWE_BASE_COMMIT` and `SWE_HINTS`.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    template: String,
    timeout: Duration,
    env: Vec<(String, String)>,
}

impl CommandAgent {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            timeout: DEFAULT_TIMEOUT,
            env: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Extra variables for the agent process, e.g. API keys.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn command_for(&self, data_point: &CodingAgentDataPoint) -> String {
        self.template
            .replace(PROBLEM_PLACEHOLDER, &shell_quote(&data_point.problem_statement))
    }

    fn request_for(&self, data_point: &CodingAgentDataPoint) -> ExecRequest {
        let mut request = ExecRequest::new(self.command_for(data_point), self.timeout)
            .with_env("SWE_PROBLEM_STATEMENT", &data_point.problem_statement)
            .with_env("SWE_INSTANCE_ID", &data_point.instance_id)
            .with_env("SWE_REPO", &data_point.repo)
            .with_env("SWE_BASE_COMMIT", &data_point.base_commit)
            .with_env("SWE_HINTS", &data_point.hints_text);
        request.env.extend(self.env.iter().cloned());
        request
    }
}

/// Everything changed in `env`'s tree since the checked-out commit,
/// untracked files included.
async fn collect_changes(env: &ExecutionEnvironment) -> Result<String, AgentError> {
    let workdir = env.workdir();
    git(workdir, &["add", "--all"])
        .await
        .map_err(AgentError::Collect)?;
    git(
        workdir,
        &["diff", "--cached", "--no-color", "--no-ext-diff", "HEAD"],
    )
    .await
    .map_err(AgentError::Collect)
}

#[async_trait]
impl PatchAgent for CommandAgent {
    fn name(&self) -> &str {
        "command"
    }

    async fn propose_patch(
        &self,
        data_point: &CodingAgentDataPoint,
        env: Option<&ExecutionEnvironment>,
    ) -> Result<CandidatePatch, AgentError> {
        let env = env.ok_or(AgentError::NoEnvironment)?;
        let started = Instant::now();

        tracing::info!(
            instance_id = %data_point.instance_id,
            environment = %env.id(),
            "Running agent command"
        );
        let output = env
            .execute(self.request_for(data_point))
            .await
            .map_err(|e| AgentError::ExecutionFailed(e.to_string()))?;

        if output.timed_out {
            return Err(AgentError::Timeout(self.timeout));
        }
        let log = tail(&output.combined(), LOG_TAIL).to_string();
        if output.exit_code != 0 {
            return Err(AgentError::ExecutionFailed(format!(
                "exit code {}: {}",
                output.exit_code, log
            )));
        }

        let diff = collect_changes(env).await?;
        tracing::debug!(
            instance_id = %data_point.instance_id,
            diff_bytes = diff.len(),
            "Collected agent changes"
        );
        Ok(CandidatePatch {
            diff,
            duration: started.elapsed(),
            log,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::execution::{EnvironmentConfig, EnvironmentManager, GitMirror, LocalExecutor};
    use crate::runner::frameworks::TestFramework;
    use crate::swe::{RepoProfile, RepoRef};
    use chrono::Utc;
    use std::path::Path;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn upstream(dir: &Path) -> String {
        git(dir, &["init", "--quiet"]).await.unwrap();
        git(dir, &["config", "user.email", "t@example.com"]).await.unwrap();
        git(dir, &["config", "user.name", "t"]).await.unwrap();
        std::fs::write(dir.join("a.txt"), "broken\n").unwrap();
        git(dir, &["add", "."]).await.unwrap();
        git(dir, &["commit", "--quiet", "-m", "init"]).await.unwrap();
        git(dir, &["rev-parse", "HEAD"]).await.unwrap().trim().to_string()
    }

    fn data_point(base: &str) -> CodingAgentDataPoint {
        CodingAgentDataPoint {
            instance_id: "acme__widgets-1".to_string(),
            repo: "acme/widgets".to_string(),
            issue_number: 1,
            pull_number: 2,
            base_commit: base.to_string(),
            merge_commit: "f".repeat(40),
            problem_statement: "a.txt says broken\n\nit's wrong".to_string(),
            hints_text: String::new(),
            patch: String::new(),
            test_patch: String::new(),
            expected_pass: vec![],
            test_framework: TestFramework::Pytest,
            test_command: None,
            created_at: Utc::now(),
            merged_at: None,
            version: None,
            environment_setup_commit: String::new(),
            digest: String::new(),
        }
    }

    #[test]
    fn test_problem_placeholder_is_quoted() {
        let agent = CommandAgent::new("agent -p {problem}");
        let command = agent.command_for(&data_point("abc"));
        assert!(command.starts_with("agent -p '"));
        assert!(command.contains("it'\\''s wrong"));
    }

    #[tokio::test]
    async fn test_changes_become_the_candidate_patch() {
        let root = tempfile::tempdir().unwrap();
        let repo_dir = root.path().join("upstream");
        std::fs::create_dir(&repo_dir).unwrap();
        let base = upstream(&repo_dir).await;

        let mut profile = RepoProfile::for_repo(&RepoRef::parse("acme/widgets").unwrap(), TestFramework::Pytest);
        profile.install.clear();
        let manager = EnvironmentManager::new(
            Arc::new(LocalExecutor::new()),
            Arc::new(GitMirror::new(repo_dir.to_string_lossy(), root.path().join("mirror.git"))),
            Arc::new(profile),
            EnvironmentConfig::default().with_root(root.path().join("envs")),
        );
        let agent = CommandAgent::new(
            "test \"$SWE_INSTANCE_ID\" = acme__widgets-1 && printf 'fixed\\n' > a.txt && printf 'x\\n' > new.txt",
        );
        let dp = data_point(&base);
        let cancel = CancellationToken::new();
        let candidate = manager
            .with_environment("agent", &base, &cancel, |env| async move {
                agent.propose_patch(&dp, Some(env.as_ref())).await
            })
            .await
            .unwrap()
            .unwrap();

        assert!(candidate.diff.contains("-broken"));
        assert!(candidate.diff.contains("+fixed"));
        assert!(candidate.diff.contains("new file mode"));
        crate::swe::PatchSet::parse(&candidate.diff).unwrap();
    }

    #[tokio::test]
    async fn test_failing_command_is_an_agent_error() {
        let root = tempfile::tempdir().unwrap();
        let repo_dir = root.path().join("upstream");
        std::fs::create_dir(&repo_dir).unwrap();
        let base = upstream(&repo_dir).await;

        let mut profile = RepoProfile::for_repo(&RepoRef::parse("acme/widgets").unwrap(), TestFramework::Pytest);
        profile.install.clear();
        let manager = EnvironmentManager::new(
            Arc::new(LocalExecutor::new()),
            Arc::new(GitMirror::new(repo_dir.to_string_lossy(), root.path().join("mirror.git"))),
            Arc::new(profile),
            EnvironmentConfig::default(),
        );
        let agent = CommandAgent::new("echo nope >&2; exit 3");
        let dp = data_point(&base);
        let cancel = CancellationToken::new();
        let result = manager
            .with_environment("agent", &base, &cancel, |env| async move {
                agent.propose_patch(&dp, Some(env.as_ref())).await
            })
            .await
            .unwrap();
        match result {
            Err(AgentError::ExecutionFailed(message)) => assert!(message.contains("nope")),
            other => panic!("unexpected: {:?}", other.map(|c| c.diff)),
        }
    }
}
