//! Evaluation harness: score candidate patches against mined data points.
//!
//! # Architecture
//!
//! ```text
//! CodingAgentDataPoint → PatchAgent → candidate diff
//!                                        ↓
//!     fresh environment → PatchApplicator (candidate, then test patch)
//!                       → TestRunner → EvaluationOutcome → ResultsAccumulator
//! ```
//!
//! # Example
//!
//! ```ignore
//! use swe_harvest::runner::{Evaluator, EvaluatorConfig, GoldPatchAgent};
//!
//! let evaluator = Evaluator::new(manager, Arc::new(GoldPatchAgent), EvaluatorConfig::default());
//! let summary = evaluator.evaluate(&data_points, &cancel).await;
//! println!("Resolved: {:.1}%", summary.resolved_rate * 100.0);
//! ```

pub mod agents;
pub mod evaluator;
pub mod frameworks;
pub mod patch;
pub mod result;
pub mod test_runner;

pub use agents::{
    create_agent, AgentError, AgentType, CandidatePatch, CommandAgent, GoldPatchAgent, NullAgent,
    PatchAgent,
};
pub use evaluator::{Evaluator, EvaluatorConfig};
pub use frameworks::TestFramework;
pub use patch::{ApplyResult, FileChange, PatchApplicator};
pub use result::{
    EvaluationOutcome, EvaluationState, EvaluationSummary, FailureReason, ResultsAccumulator,
    TestResult, TestStatus,
};
pub use test_runner::{TestRunReport, TestRunner};
