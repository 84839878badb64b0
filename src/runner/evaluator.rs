//! Scoring candidate patches against data points.
//!
//! ```text
//! agent env (optional): acquire(base) → agent.propose_patch → release
//! eval env:             acquire(base) → apply candidate → apply test patch
//!                       → run expected-pass tests → score → release
//! ```
//!
//! Each data point gets fresh environments; environments are released on
//! every exit path by [`EnvironmentManager::with_environment`].

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::agents::{CandidatePatch, PatchAgent};
use super::patch::PatchApplicator;
use super::result::{
    EvaluationOutcome, EvaluationState, EvaluationSummary, FailureReason, ResultsAccumulator,
};
use super::test_runner::TestRunner;
use crate::error::{EnvironmentSetupError, PatchError};
use crate::execution::{EnvironmentManager, ExecutionEnvironment};
use crate::swe::{CodingAgentDataPoint, PatchSet};

#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Data points evaluated at the same time.
    pub concurrency: usize,
    /// Run the whole suite instead of only the expected-pass tests, so that
    /// regressions outside the expected set are visible.
    pub run_full_suite: bool,
    /// Give a timed-out test run one more attempt.
    pub retry_test_timeout: bool,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            run_full_suite: false,
            retry_test_timeout: false,
        }
    }
}

impl EvaluatorConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_full_suite(mut self, enabled: bool) -> Self {
        self.run_full_suite = enabled;
        self
    }

    pub fn with_timeout_retry(mut self, enabled: bool) -> Self {
        self.retry_test_timeout = enabled;
        self
    }
}

pub struct Evaluator {
    manager: Arc<EnvironmentManager>,
    agent: Arc<dyn PatchAgent>,
    applicator: PatchApplicator,
    config: EvaluatorConfig,
}

impl Evaluator {
    pub fn new(
        manager: Arc<EnvironmentManager>,
        agent: Arc<dyn PatchAgent>,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            manager,
            agent,
            applicator: PatchApplicator::new(),
            config,
        }
    }

    pub fn manager(&self) -> &EnvironmentManager {
        &self.manager
    }

    /// Evaluate every data point and summarise.
    pub async fn evaluate(
        &self,
        data_points: &[CodingAgentDataPoint],
        cancel: &CancellationToken,
    ) -> EvaluationSummary {
        let results = ResultsAccumulator::new();
        self.run(data_points, &results, cancel).await;
        EvaluationSummary::from_outcomes(results.into_sorted())
    }

    /// Evaluate `data_points` with at most `concurrency` in flight, pushing
    /// one outcome per data point into `results`. After cancellation no new
    /// evaluation starts and pending ones are recorded as cancelled.
    pub async fn run(
        &self,
        data_points: &[CodingAgentDataPoint],
        results: &ResultsAccumulator,
        cancel: &CancellationToken,
    ) {
        let concurrency = self.config.concurrency.max(1);
        let permits = Semaphore::new(concurrency);
        tracing::info!(
            data_points = data_points.len(),
            concurrency = concurrency,
            agent = %self.agent.name(),
            "Starting evaluation"
        );

        stream::iter(data_points)
            .for_each_concurrent(None, |data_point| {
                let permits = &permits;
                async move {
                    let permit = tokio::select! {
                        permit = permits.acquire() => permit.ok(),
                        _ = cancel.cancelled() => None,
                    };
                    let outcome = match permit {
                        Some(_permit) if !cancel.is_cancelled() => {
                            self.evaluate_one(data_point, cancel).await
                        }
                        _ => self.cancelled_outcome(data_point),
                    };
                    results.push(outcome);
                }
            })
            .await;
    }

    fn cancelled_outcome(&self, data_point: &CodingAgentDataPoint) -> EvaluationOutcome {
        let mut outcome = EvaluationOutcome::new(
            &data_point.instance_id,
            self.agent.name(),
            data_point.expected_pass.clone(),
        );
        outcome.fail(FailureReason::Cancelled);
        outcome.finish();
        outcome
    }

    /// Evaluate a single data point. Never fails: problems end up as a
    /// `Failed` state on the outcome.
    pub async fn evaluate_one(
        &self,
        data_point: &CodingAgentDataPoint,
        cancel: &CancellationToken,
    ) -> EvaluationOutcome {
        let mut outcome = EvaluationOutcome::new(
            &data_point.instance_id,
            self.agent.name(),
            data_point.expected_pass.clone(),
        );

        match self.propose(data_point, cancel).await {
            Ok(candidate) => {
                outcome.candidate_patch = candidate.diff;
                self.score(data_point, &mut outcome, cancel).await;
            }
            Err(reason) => outcome.fail(reason),
        }

        outcome.finish();
        match outcome.failure_reason() {
            Some(reason) => tracing::warn!(
                instance_id = %outcome.instance_id,
                reason = %reason,
                "Evaluation failed"
            ),
            None => tracing::info!(
                instance_id = %outcome.instance_id,
                score = outcome.score,
                resolved = outcome.resolved,
                regressions = outcome.regressions.len(),
                duration_ms = outcome.duration_ms,
                "Evaluated data point"
            ),
        }
        outcome
    }

    async fn propose(
        &self,
        data_point: &CodingAgentDataPoint,
        cancel: &CancellationToken,
    ) -> Result<CandidatePatch, FailureReason> {
        if !self.agent.needs_environment() {
            return self
                .agent
                .propose_patch(data_point, None)
                .await
                .map_err(|e| FailureReason::Agent {
                    message: e.to_string(),
                });
        }

        let agent = self.agent.clone();
        let id = format!("{}-agent", data_point.instance_id);
        self.manager
            .with_environment(&id, &data_point.base_commit, cancel, |env| async move {
                agent.propose_patch(data_point, Some(env.as_ref())).await
            })
            .await
            .map_err(setup_failure)?
            .map_err(|e| FailureReason::Agent {
                message: e.to_string(),
            })
    }

    async fn score(
        &self,
        data_point: &CodingAgentDataPoint,
        outcome: &mut EvaluationOutcome,
        cancel: &CancellationToken,
    ) {
        let candidate = match PatchSet::parse(&outcome.candidate_patch) {
            Ok(patch) => patch,
            Err(e) => {
                outcome.fail(FailureReason::InvalidPatch {
                    message: e.to_string(),
                });
                return;
            }
        };
        let test_patch = match data_point.test_patch_set() {
            Ok(patch) => patch,
            Err(e) => {
                outcome.fail(FailureReason::InvalidPatch {
                    message: format!("test patch: {}", e),
                });
                return;
            }
        };

        let id = format!("{}-eval", data_point.instance_id);
        let staged = &mut *outcome;
        let result = self
            .manager
            .with_environment(&id, &data_point.base_commit, cancel, |env| async move {
                staged.advance(EvaluationState::EnvironmentReady);
                self.apply_and_test(&env, data_point, &candidate, &test_patch, staged)
                    .await
            })
            .await;
        if let Err(e) = result {
            outcome.fail(setup_failure(e));
        }
    }

    async fn apply_and_test(
        &self,
        env: &ExecutionEnvironment,
        data_point: &CodingAgentDataPoint,
        candidate: &PatchSet,
        test_patch: &PatchSet,
        outcome: &mut EvaluationOutcome,
    ) {
        if let Err(e) = self.applicator.apply(env, candidate).await {
            outcome.fail(match e {
                PatchError::Malformed(_) | PatchError::UnsafePath(_) | PatchError::Unsupported { .. } => {
                    FailureReason::InvalidPatch {
                        message: e.to_string(),
                    }
                }
                _ => FailureReason::PatchConflict {
                    message: e.to_string(),
                },
            });
            return;
        }
        if let Err(e) = self.applicator.apply(env, test_patch).await {
            outcome.fail(FailureReason::TestPatchConflict {
                message: e.to_string(),
            });
            return;
        }
        outcome.advance(EvaluationState::PatchApplied);

        let runner = TestRunner::from_profile(self.manager.profile())
            .with_command_override(data_point.test_command.as_deref())
            .with_timeout_retry(self.config.retry_test_timeout);
        let selection: &[String] = if self.config.run_full_suite {
            &[]
        } else {
            &data_point.expected_pass
        };
        let report = match runner.run(env, selection).await {
            Ok(report) => report,
            Err(e) => {
                outcome.fail(FailureReason::TestExecution {
                    message: e.to_string(),
                });
                return;
            }
        };
        outcome.advance(EvaluationState::TestsRun);

        if runner.framework() != data_point.test_framework {
            tracing::warn!(
                instance_id = %data_point.instance_id,
                profile = %runner.framework(),
                data_point = %data_point.test_framework,
                "Test framework differs from the data point's; using the profile's"
            );
        }
        outcome.timed_out = report.timed_out;
        outcome.score_results(runner.framework(), report.results);
        outcome.advance(EvaluationState::Scored);
    }
}

fn setup_failure(error: EnvironmentSetupError) -> FailureReason {
    match error {
        EnvironmentSetupError::Cancelled => FailureReason::Cancelled,
        other => FailureReason::EnvironmentSetup {
            message: other.to_string(),
        },
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ExecError;
    use crate::execution::{
        EnvironmentConfig, ExecOutput, ExecRequest, Executor, ExecutorKind, LocalExecutor,
        SandboxHandle, WorkspaceSource,
    };
    use crate::runner::agents::{GoldPatchAgent, NullAgent};
    use crate::runner::frameworks::TestFramework;
    use crate::swe::{RepoProfile, RepoRef};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::path::Path;

    const SOURCE: &str = "def add(a, b):\n    return a - b\n";

    const GOLD: &str = "\
diff --git a/calc.py b/calc.py
--- a/calc.py
+++ b/calc.py
@@ -1,2 +1,2 @@
 def add(a, b):
-    return a - b
+    return a + b
";

    const TEST_PATCH: &str = "\
diff --git a/check.sh b/check.sh
new file mode 100644
--- /dev/null
+++ b/check.sh
@@ -0,0 +1,6 @@
+if grep -q 'a + b' calc.py; then
+  echo 'test add ... ok'
+else
+  echo 'test add ... FAILED'
+fi
+echo 'test unrelated ... FAILED'
";

    struct Files;

    #[async_trait]
    impl WorkspaceSource for Files {
        async fn checkout(&self, _revision: &str, dest: &Path) -> Result<(), EnvironmentSetupError> {
            std::fs::create_dir_all(dest)?;
            std::fs::write(dest.join("calc.py"), SOURCE)?;
            Ok(())
        }
    }

    fn profile() -> RepoProfile {
        let mut profile =
            RepoProfile::for_repo(&RepoRef::parse("acme/calc").unwrap(), TestFramework::Cargo);
        profile.install.clear();
        profile.test_command = Some("sh check.sh".to_string());
        profile
    }

    fn data_point(n: u64) -> CodingAgentDataPoint {
        CodingAgentDataPoint {
            instance_id: format!("acme__calc-{}", n),
            repo: "acme/calc".to_string(),
            issue_number: n,
            pull_number: n + 100,
            base_commit: "a".repeat(40),
            merge_commit: "b".repeat(40),
            problem_statement: "add subtracts".to_string(),
            hints_text: String::new(),
            patch: GOLD.to_string(),
            test_patch: TEST_PATCH.to_string(),
            expected_pass: vec!["add".to_string()],
            test_framework: TestFramework::Cargo,
            test_command: None,
            created_at: Utc::now(),
            merged_at: None,
            version: None,
            environment_setup_commit: String::new(),
            digest: CodingAgentDataPoint::compute_digest(GOLD, TEST_PATCH),
        }
    }

    fn evaluator(agent: Arc<dyn PatchAgent>, executor: Arc<dyn Executor>) -> Evaluator {
        let manager = EnvironmentManager::new(
            executor,
            Arc::new(Files),
            Arc::new(profile()),
            EnvironmentConfig::default(),
        );
        Evaluator::new(
            Arc::new(manager),
            agent,
            EvaluatorConfig::default().with_concurrency(2),
        )
    }

    #[tokio::test]
    async fn test_gold_agent_resolves_and_regressions_do_not_count() {
        let evaluator = evaluator(Arc::new(GoldPatchAgent), Arc::new(LocalExecutor::new()));
        let cancel = CancellationToken::new();
        let outcome = evaluator.evaluate_one(&data_point(1), &cancel).await;

        assert_eq!(outcome.state, EvaluationState::Scored);
        assert!(outcome.resolved);
        assert_eq!(outcome.score, 1.0);
        assert_eq!(outcome.regressions, vec!["unrelated".to_string()]);
        let states: Vec<_> = outcome.transitions.iter().map(|t| t.state.as_str()).collect();
        assert_eq!(
            states,
            vec!["pending", "environment_ready", "patch_applied", "tests_run", "scored"]
        );
        assert_eq!(evaluator.manager().active(), 0);
        assert_eq!(evaluator.manager().released(), 1);
    }

    #[tokio::test]
    async fn test_null_agent_scores_zero() {
        let evaluator = evaluator(Arc::new(NullAgent), Arc::new(LocalExecutor::new()));
        let outcome = evaluator
            .evaluate_one(&data_point(1), &CancellationToken::new())
            .await;
        assert_eq!(outcome.state, EvaluationState::Scored);
        assert!(!outcome.resolved);
        assert_eq!(outcome.score, 0.0);
    }

    #[tokio::test]
    async fn test_conflicting_test_patch_fails_and_tears_down() {
        let evaluator = evaluator(Arc::new(GoldPatchAgent), Arc::new(LocalExecutor::new()));
        let mut dp = data_point(1);
        dp.test_patch = GOLD.replace("a - b", "a * b");
        let outcome = evaluator.evaluate_one(&dp, &CancellationToken::new()).await;

        // The gold patch already rewrote the line the test patch expects.
        assert!(matches!(
            outcome.failure_reason(),
            Some(FailureReason::TestPatchConflict { .. })
        ));
        assert_eq!(evaluator.manager().active(), 0);
        assert_eq!(evaluator.manager().released(), 1);
    }

    #[tokio::test]
    async fn test_invalid_candidate_patch() {
        let evaluator = evaluator(Arc::new(GoldPatchAgent), Arc::new(LocalExecutor::new()));
        let mut dp = data_point(1);
        dp.patch = "--- a/x\n+++ b/x\n@@ -1,2 +1,2 @@\n-only one line\n".to_string();
        let outcome = evaluator.evaluate_one(&dp, &CancellationToken::new()).await;
        assert!(matches!(
            outcome.failure_reason(),
            Some(FailureReason::InvalidPatch { .. })
        ));
        assert_eq!(evaluator.manager().released(), 0);
    }

    /// Starts fine, then refuses to run anything.
    struct BrokenExecutor;

    #[async_trait]
    impl Executor for BrokenExecutor {
        fn kind(&self) -> ExecutorKind {
            ExecutorKind::Local
        }

        async fn start(
            &self,
            _name: &str,
            workdir: &Path,
            _profile: &RepoProfile,
        ) -> Result<SandboxHandle, EnvironmentSetupError> {
            Ok(SandboxHandle::Local {
                workdir: workdir.to_path_buf(),
            })
        }

        async fn execute(
            &self,
            _handle: &SandboxHandle,
            request: &ExecRequest,
        ) -> Result<ExecOutput, ExecError> {
            Err(ExecError::Spawn {
                command: request.command.clone(),
                message: "no shell".to_string(),
            })
        }

        async fn stop(&self, _handle: &SandboxHandle) -> Result<(), ExecError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_execution_failure_is_recorded() {
        let evaluator = evaluator(Arc::new(GoldPatchAgent), Arc::new(BrokenExecutor));
        let outcome = evaluator
            .evaluate_one(&data_point(1), &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome.failure_reason(),
            Some(FailureReason::TestExecution { .. })
        ));
        assert_eq!(outcome.transitions.len(), 4);
        assert_eq!(evaluator.manager().released(), 1);
    }

    #[tokio::test]
    async fn test_batch_is_sorted_and_cancellation_skips_work() {
        let evaluator = evaluator(Arc::new(GoldPatchAgent), Arc::new(LocalExecutor::new()));
        let batch = vec![data_point(3), data_point(1), data_point(2)];
        let summary = evaluator.evaluate(&batch, &CancellationToken::new()).await;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.resolved, 3);
        let ids: Vec<_> = summary.outcomes.iter().map(|o| o.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["acme__calc-1", "acme__calc-2", "acme__calc-3"]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = evaluator.evaluate(&batch, &cancel).await;
        assert_eq!(summary.failures.get("cancelled"), Some(&3));
    }
}
