//! Reference agents that never touch an environment.

use async_trait::async_trait;

use super::{AgentError, CandidatePatch, PatchAgent};
use crate::execution::ExecutionEnvironment;
use crate::swe::CodingAgentDataPoint;

/// Proposes the data point's gold patch. Every valid data point should be
/// resolved by it.
#[derive(Debug, Clone, Copy, Default)]
pub struct GoldPatchAgent;

#[async_trait]
impl PatchAgent for GoldPatchAgent {
    fn name(&self) -> &str {
        "gold"
    }

    fn needs_environment(&self) -> bool {
        false
    }

    async fn propose_patch(
        &self,
        data_point: &CodingAgentDataPoint,
        _env: Option<&ExecutionEnvironment>,
    ) -> Result<CandidatePatch, AgentError> {
        Ok(CandidatePatch::new(data_point.patch.clone()))
    }
}

/// Proposes an empty patch. No valid data point should be resolved by it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAgent;

#[async_trait]
impl PatchAgent for NullAgent {
    fn name(&self) -> &str {
        "null"
    }

    fn needs_environment(&self) -> bool {
        false
    }

    async fn propose_patch(
        &self,
        _data_point: &CodingAgentDataPoint,
        _env: Option<&ExecutionEnvironment>,
    ) -> Result<CandidatePatch, AgentError> {
        Ok(CandidatePatch::default())
    }
}
