//! Running a repository's tests inside an environment and reading back
//! per-test verdicts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::frameworks::TestFramework;
use super::result::{TestResult, TestStatus};
use crate::error::{ExecError, TestRunError};
use crate::execution::{ExecRequest, ExecutionEnvironment};
use crate::swe::profile::render_test_command;
use crate::swe::RepoProfile;
use crate::utils::retry::RetryPolicy;
use crate::utils::tail;

/// Amount of raw output kept on a report.
const OUTPUT_TAIL: usize = 8_000;

/// What one test invocation produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRunReport {
    pub command: String,
    pub results: Vec<TestResult>,
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    /// Tail of the combined output.
    pub output: String,
}

/// Builds and runs test commands for one repository profile.
#[derive(Debug, Clone)]
pub struct TestRunner {
    framework: TestFramework,
    template: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl TestRunner {
    pub fn from_profile(profile: &RepoProfile) -> Self {
        Self {
            framework: profile.test_framework,
            template: profile.test_command_template().to_string(),
            timeout: profile.test_timeout(),
            retry: RetryPolicy::none(),
        }
    }

    /// Use a data point's own command template when it carries one.
    pub fn with_command_override(mut self, template: Option<&str>) -> Self {
        if let Some(template) = template.filter(|t| !t.trim().is_empty()) {
            self.template = template.to_string();
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Allow one extra attempt after a timeout.
    pub fn with_timeout_retry(mut self, enabled: bool) -> Self {
        self.retry = if enabled {
            RetryPolicy::default()
                .with_max_attempts(2)
                .with_base_delay(Duration::from_secs(5))
                .with_max_delay(Duration::from_secs(5))
        } else {
            RetryPolicy::none()
        };
        self
    }

    pub fn framework(&self) -> TestFramework {
        self.framework
    }

    pub fn command_for(&self, selection: &[String]) -> String {
        render_test_command(self.framework, &self.template, selection)
    }

    /// Run `selection` (everything when empty) in `env`.
    ///
    /// A timeout marks every selected test `error`. Otherwise results are
    /// parsed from whatever output was captured, and selected tests that
    /// never reported are `error`.
    pub async fn run(
        &self,
        env: &ExecutionEnvironment,
        selection: &[String],
    ) -> Result<TestRunReport, TestRunError> {
        let command = self.command_for(selection);
        let timeout = self.timeout;
        let command_ref = command.as_str();

        tracing::debug!(
            environment = %env.id(),
            command = %command,
            selected = selection.len(),
            "Running tests"
        );

        let attempt = self
            .retry
            .run("run tests", move || async move {
                let output = env
                    .execute(ExecRequest::new(command_ref, timeout))
                    .await
                    .map_err(|e| match e {
                        ExecError::Spawn { message, .. } => TestRunError::Spawn(message),
                        other => TestRunError::Exec(other),
                    })?;
                if output.timed_out {
                    return Err(TestRunError::Timeout {
                        seconds: timeout.as_secs(),
                        partial_output: tail(&output.combined(), OUTPUT_TAIL).to_string(),
                    });
                }
                Ok(output)
            })
            .await;

        match attempt {
            Ok(output) => {
                let combined = output.combined();
                let mut results = self.framework.parse_output(&combined);
                for id in selection {
                    if self.framework.verdict(id, &results).is_none() {
                        results.push(TestResult::new(
                            id.clone(),
                            TestStatus::Error,
                            format!("no result reported (exit code {})", output.exit_code),
                        ));
                    }
                }
                if output.exit_code != 0 && results.is_empty() {
                    tracing::warn!(
                        environment = %env.id(),
                        exit_code = output.exit_code,
                        "Test command failed without reporting any tests"
                    );
                }
                Ok(TestRunReport {
                    command,
                    results,
                    exit_code: Some(output.exit_code),
                    timed_out: false,
                    output: tail(&combined, OUTPUT_TAIL).to_string(),
                })
            }
            Err(TestRunError::Timeout {
                seconds,
                partial_output,
            }) => {
                tracing::warn!(
                    environment = %env.id(),
                    seconds = seconds,
                    "Test command timed out"
                );
                Ok(TestRunReport {
                    results: self.timed_out_results(selection, &partial_output, seconds),
                    command,
                    exit_code: None,
                    timed_out: true,
                    output: partial_output,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Every test of a killed invocation is `error`: the selection when one
    /// was given, otherwise whatever the partial output named.
    fn timed_out_results(&self, selection: &[String], partial: &str, seconds: u64) -> Vec<TestResult> {
        let reason = format!("timed out after {}s", seconds);
        let ids: Vec<String> = if selection.is_empty() {
            self.framework
                .parse_output(partial)
                .into_iter()
                .map(|r| r.id)
                .collect()
        } else {
            selection.to_vec()
        };
        ids.into_iter()
            .map(|id| TestResult::new(id, TestStatus::Error, reason.clone()))
            .collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::execution::{EnvironmentConfig, EnvironmentManager, LocalExecutor, WorkspaceSource};
    use crate::error::EnvironmentSetupError;
    use crate::swe::RepoRef;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// Materialises a fixed set of files as the "checkout".
    struct Files(Vec<(&'static str, &'static str)>);

    #[async_trait]
    impl WorkspaceSource for Files {
        async fn checkout(&self, _revision: &str, dest: &Path) -> Result<(), EnvironmentSetupError> {
            for (path, content) in &self.0 {
                let full = dest.join(path);
                std::fs::create_dir_all(full.parent().unwrap())?;
                std::fs::write(full, content)?;
            }
            Ok(())
        }
    }

    fn manager(files: Vec<(&'static str, &'static str)>, profile: RepoProfile) -> EnvironmentManager {
        EnvironmentManager::new(
            Arc::new(LocalExecutor::new()),
            Arc::new(Files(files)),
            Arc::new(profile),
            EnvironmentConfig::default(),
        )
    }

    fn profile(command: &str, timeout_secs: u64) -> RepoProfile {
        let repo = RepoRef::parse("acme/widgets").unwrap();
        let mut profile = RepoProfile::for_repo(&repo, TestFramework::Cargo);
        profile.install.clear();
        profile.test_command = Some(command.to_string());
        profile.test_timeout_secs = timeout_secs;
        profile
    }

    #[test]
    fn test_command_override() {
        let runner = TestRunner::from_profile(&profile("cargo test -- {tests}", 10))
            .with_command_override(Some("cargo test --lib -- {tests} --exact"));
        assert_eq!(
            runner.command_for(&["a::b".to_string()]),
            "cargo test --lib -- a::b --exact"
        );
        let runner = runner.with_command_override(Some("  "));
        assert!(runner.command_for(&[]).starts_with("cargo test --lib"));
    }

    #[tokio::test]
    async fn test_crash_marks_unreported_selection_as_error() {
        let script = "printf 'test one ... ok\\n'\nexit 101\n";
        let manager = manager(vec![("run.sh", script)], profile("sh run.sh {tests}", 10));
        let cancel = CancellationToken::new();
        let report = manager
            .with_environment("crash", "HEAD", &cancel, |env| async move {
                TestRunner::from_profile(&profile("sh run.sh {tests}", 10))
                    .run(&env, &["one".to_string(), "two".to_string()])
                    .await
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.exit_code, Some(101));
        assert!(!report.timed_out);
        let status = |id: &str| report.results.iter().find(|r| r.id == id).map(|r| r.status);
        assert_eq!(status("one"), Some(TestStatus::Pass));
        assert_eq!(status("two"), Some(TestStatus::Error));
    }

    #[tokio::test]
    async fn test_timeout_marks_every_selected_test_error() {
        let script = "printf 'test one ... ok\\n'\nsleep 30\n";
        let profile = profile("sh run.sh {tests}", 1);
        let manager = manager(vec![("run.sh", script)], profile.clone());
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let report = manager
            .with_environment("slow", "HEAD", &cancel, |env| async move {
                TestRunner::from_profile(&profile)
                    .run(&env, &["one".to_string(), "two".to_string()])
                    .await
            })
            .await
            .unwrap()
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(15));
        assert!(report.timed_out);
        assert_eq!(report.results.len(), 2);
        assert!(report.results.iter().all(|r| r.status == TestStatus::Error));
        assert!(report.output.contains("test one ... ok"));
    }
}
