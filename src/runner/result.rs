//! Test results, evaluation state and per-data-point outcomes.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::frameworks::TestFramework;

/// Verdict for a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pass,
    Skip,
    Fail,
    Error,
}

impl TestStatus {
    /// The more severe of two statuses (`error` > `fail` > `skip` > `pass`).
    pub fn worst(self, other: TestStatus) -> TestStatus {
        self.max(other)
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestStatus::Pass => write!(f, "pass"),
            TestStatus::Skip => write!(f, "skip"),
            TestStatus::Fail => write!(f, "fail"),
            TestStatus::Error => write!(f, "error"),
        }
    }
}

/// Result of one test as reported by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub id: String,
    pub status: TestStatus,
    /// The output line(s) the verdict was read from, or a synthetic reason.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}

impl TestResult {
    pub fn new(id: impl Into<String>, status: TestStatus, output: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status,
            output: output.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation state machine
// ---------------------------------------------------------------------------

/// Why an evaluation stopped before being scored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Agent { message: String },
    EnvironmentSetup { message: String },
    /// The candidate patch is not a parseable diff.
    InvalidPatch { message: String },
    PatchConflict { message: String },
    TestPatchConflict { message: String },
    TestExecution { message: String },
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Agent { message } => write!(f, "agent error: {}", message),
            FailureReason::EnvironmentSetup { message } => {
                write!(f, "environment setup failed: {}", message)
            }
            FailureReason::InvalidPatch { message } => write!(f, "invalid patch: {}", message),
            FailureReason::PatchConflict { message } => write!(f, "patch conflict: {}", message),
            FailureReason::TestPatchConflict { message } => {
                write!(f, "test patch conflict: {}", message)
            }
            FailureReason::TestExecution { message } => {
                write!(f, "test execution failed: {}", message)
            }
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FailureReason {
    /// Short label used for summary tallies.
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::Agent { .. } => "agent",
            FailureReason::EnvironmentSetup { .. } => "environment_setup",
            FailureReason::InvalidPatch { .. } => "invalid_patch",
            FailureReason::PatchConflict { .. } => "patch_conflict",
            FailureReason::TestPatchConflict { .. } => "test_patch_conflict",
            FailureReason::TestExecution { .. } => "test_execution",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

/// Lifecycle of one data point's evaluation.
///
/// `Pending → EnvironmentReady → PatchApplied → TestsRun → Scored`, with
/// `Failed` reachable from every non-terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EvaluationState {
    Pending,
    EnvironmentReady,
    PatchApplied,
    TestsRun,
    Scored,
    Failed { reason: FailureReason },
}

impl EvaluationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EvaluationState::Scored | EvaluationState::Failed { .. })
    }

    pub fn can_transition_to(&self, next: &EvaluationState) -> bool {
        use EvaluationState::*;
        match (self, next) {
            (s, Failed { .. }) => !s.is_terminal(),
            (Pending, EnvironmentReady)
            | (EnvironmentReady, PatchApplied)
            | (PatchApplied, TestsRun)
            | (TestsRun, Scored) => true,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EvaluationState::Pending => "pending",
            EvaluationState::EnvironmentReady => "environment_ready",
            EvaluationState::PatchApplied => "patch_applied",
            EvaluationState::TestsRun => "tests_run",
            EvaluationState::Scored => "scored",
            EvaluationState::Failed { .. } => "failed",
        }
    }
}

impl std::fmt::Display for EvaluationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvaluationState::Failed { reason } => write!(f, "failed ({})", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// A recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Everything known about one data point's evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub instance_id: String,
    pub agent: String,
    pub state: EvaluationState,
    pub transitions: Vec<StateTransition>,
    pub expected_pass: Vec<String>,
    /// Status of each expected-pass id after aggregation.
    pub expected_results: BTreeMap<String, TestStatus>,
    pub results: Vec<TestResult>,
    /// Fraction of expected-pass tests that passed.
    pub score: f64,
    pub resolved: bool,
    /// Tests outside the expected set that did not pass. Informational only.
    pub regressions: Vec<String>,
    pub timed_out: bool,
    #[serde(default)]
    pub candidate_patch: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl EvaluationOutcome {
    pub fn new(
        instance_id: impl Into<String>,
        agent: impl Into<String>,
        expected_pass: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            agent: agent.into(),
            state: EvaluationState::Pending,
            transitions: vec![StateTransition {
                state: EvaluationState::Pending.name().to_string(),
                at: now,
            }],
            expected_pass,
            expected_results: BTreeMap::new(),
            results: Vec::new(),
            score: 0.0,
            resolved: false,
            regressions: Vec::new(),
            timed_out: false,
            candidate_patch: String::new(),
            started_at: now,
            finished_at: None,
            duration_ms: 0,
        }
    }

    /// Move to `next`, recording the transition. Illegal transitions are
    /// logged and ignored so a terminal state is never overwritten.
    pub fn advance(&mut self, next: EvaluationState) {
        if !self.state.can_transition_to(&next) {
            tracing::warn!(
                instance_id = %self.instance_id,
                from = %self.state,
                to = %next,
                "Ignoring illegal evaluation state transition"
            );
            return;
        }
        self.transitions.push(StateTransition {
            state: next.name().to_string(),
            at: Utc::now(),
        });
        self.state = next;
    }

    pub fn fail(&mut self, reason: FailureReason) {
        self.advance(EvaluationState::Failed { reason });
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match &self.state {
            EvaluationState::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    /// Fill in the verdict from raw test results.
    pub fn score_results(&mut self, framework: TestFramework, results: Vec<TestResult>) {
        let mut expected_results = BTreeMap::new();
        for id in &self.expected_pass {
            let status = framework
                .verdict(id, &results)
                .unwrap_or(TestStatus::Error);
            expected_results.insert(id.clone(), status);
        }
        let passed = expected_results
            .values()
            .filter(|s| **s == TestStatus::Pass)
            .count();

        self.score = if expected_results.is_empty() {
            0.0
        } else {
            passed as f64 / expected_results.len() as f64
        };
        self.resolved = !expected_results.is_empty() && passed == expected_results.len();
        self.regressions = results
            .iter()
            .filter(|r| matches!(r.status, TestStatus::Fail | TestStatus::Error))
            .filter(|r| {
                !self
                    .expected_pass
                    .iter()
                    .any(|id| framework.matches(id, &r.id))
            })
            .map(|r| r.id.clone())
            .collect();
        self.expected_results = expected_results;
        self.results = results;
    }

    pub fn finish(&mut self) {
        let now = Utc::now();
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(now);
    }
}

// ---------------------------------------------------------------------------
// Accumulation and summary
// ---------------------------------------------------------------------------

/// Collects outcomes from concurrent workers. The lock is held only for the
/// push itself.
#[derive(Debug, Default)]
pub struct ResultsAccumulator {
    outcomes: Mutex<Vec<EvaluationOutcome>>,
}

impl ResultsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: EvaluationOutcome) {
        let mut guard = self
            .outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.push(outcome);
    }

    pub fn len(&self) -> usize {
        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the accumulator, returning outcomes sorted by instance id.
    pub fn into_sorted(self) -> Vec<EvaluationOutcome> {
        let mut outcomes = self
            .outcomes
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        outcomes.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        outcomes
    }
}

/// Aggregate view over a batch of outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub total: usize,
    pub scored: usize,
    pub resolved: usize,
    pub failed: usize,
    pub resolved_rate: f64,
    pub mean_score: f64,
    pub failures: BTreeMap<String, usize>,
    pub outcomes: Vec<EvaluationOutcome>,
}

impl EvaluationSummary {
    pub fn from_outcomes(outcomes: Vec<EvaluationOutcome>) -> Self {
        let total = outcomes.len();
        let scored = outcomes
            .iter()
            .filter(|o| o.state == EvaluationState::Scored)
            .count();
        let resolved = outcomes.iter().filter(|o| o.resolved).count();
        let mut failures = BTreeMap::new();
        for reason in outcomes.iter().filter_map(EvaluationOutcome::failure_reason) {
            *failures.entry(reason.label().to_string()).or_insert(0) += 1;
        }
        let failed = failures.values().sum();
        let (resolved_rate, mean_score) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                resolved as f64 / total as f64,
                outcomes.iter().map(|o| o.score).sum::<f64>() / total as f64,
            )
        };
        Self {
            total,
            scored,
            resolved,
            failed,
            resolved_rate,
            mean_score,
            failures,
            outcomes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass(id: &str) -> TestResult {
        TestResult::new(id, TestStatus::Pass, "")
    }

    fn fail(id: &str) -> TestResult {
        TestResult::new(id, TestStatus::Fail, "")
    }

    #[test]
    fn test_state_machine_happy_path() {
        let mut outcome = EvaluationOutcome::new("o__r-1", "gold", vec![]);
        outcome.advance(EvaluationState::EnvironmentReady);
        outcome.advance(EvaluationState::PatchApplied);
        outcome.advance(EvaluationState::TestsRun);
        outcome.advance(EvaluationState::Scored);
        assert_eq!(outcome.state, EvaluationState::Scored);
        let names: Vec<&str> = outcome.transitions.iter().map(|t| t.state.as_str()).collect();
        assert_eq!(
            names,
            vec!["pending", "environment_ready", "patch_applied", "tests_run", "scored"]
        );
    }

    #[test]
    fn test_state_machine_rejects_skips_and_terminal_overwrites() {
        let mut outcome = EvaluationOutcome::new("o__r-1", "gold", vec![]);
        outcome.advance(EvaluationState::TestsRun);
        assert_eq!(outcome.state, EvaluationState::Pending);

        outcome.fail(FailureReason::Cancelled);
        outcome.advance(EvaluationState::EnvironmentReady);
        outcome.fail(FailureReason::Agent {
            message: "late".into(),
        });
        assert_eq!(outcome.failure_reason(), Some(&FailureReason::Cancelled));
    }

    #[test]
    fn test_score_counts_only_expected_tests() {
        let mut outcome = EvaluationOutcome::new(
            "o__r-42",
            "gold",
            vec![
                "tests/test_foo.py::test_a".to_string(),
                "tests/test_foo.py::test_b".to_string(),
            ],
        );
        outcome.score_results(
            TestFramework::Pytest,
            vec![
                pass("tests/test_foo.py::test_a"),
                fail("tests/test_foo.py::test_b"),
                fail("tests/test_other.py::test_c"),
            ],
        );
        assert_eq!(outcome.score, 0.5);
        assert!(!outcome.resolved);
        assert_eq!(outcome.regressions, vec!["tests/test_other.py::test_c"]);
        assert_eq!(
            outcome.expected_results["tests/test_foo.py::test_b"],
            TestStatus::Fail
        );
    }

    #[test]
    fn test_missing_expected_result_counts_as_error() {
        let mut outcome =
            EvaluationOutcome::new("o__r-1", "null", vec!["tests/t.py::test_x".to_string()]);
        outcome.score_results(TestFramework::Pytest, vec![]);
        assert_eq!(outcome.score, 0.0);
        assert_eq!(outcome.expected_results["tests/t.py::test_x"], TestStatus::Error);
    }

    #[test]
    fn test_regressions_do_not_affect_score() {
        let mut outcome =
            EvaluationOutcome::new("o__r-1", "gold", vec!["tests/t.py::test_x".to_string()]);
        outcome.score_results(
            TestFramework::Pytest,
            vec![pass("tests/t.py::test_x"), fail("tests/t.py::test_unrelated")],
        );
        assert_eq!(outcome.score, 1.0);
        assert!(outcome.resolved);
        assert_eq!(outcome.regressions.len(), 1);
    }

    #[test]
    fn test_accumulator_sorts_and_summarises() {
        let acc = ResultsAccumulator::new();
        let mut b = EvaluationOutcome::new("o__r-2", "gold", vec![]);
        b.fail(FailureReason::Cancelled);
        let mut a = EvaluationOutcome::new("o__r-1", "gold", vec!["t".to_string()]);
        a.score = 1.0;
        a.resolved = true;
        acc.push(b);
        acc.push(a);
        assert_eq!(acc.len(), 2);

        let summary = EvaluationSummary::from_outcomes(acc.into_sorted());
        assert_eq!(summary.outcomes[0].instance_id, "o__r-1");
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures["cancelled"], 1);
        assert_eq!(summary.mean_score, 0.5);
    }

    #[test]
    fn test_status_severity() {
        assert_eq!(TestStatus::Pass.worst(TestStatus::Fail), TestStatus::Fail);
        assert_eq!(TestStatus::Error.worst(TestStatus::Skip), TestStatus::Error);
        assert_eq!(TestStatus::Error.to_string(), "error");
    }
}
