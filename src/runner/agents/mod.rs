//! Patch-proposing agents.
//!
//! An agent looks at a data point (and, when it asks for one, a fresh
//! environment checked out at the base commit) and returns a candidate
//! patch. Three variants exist:
//!
//! - [`GoldPatchAgent`]: returns the data point's own fix, an upper bound
//! - [`NullAgent`]: returns nothing, a lower bound
//! - [`CommandAgent`]: runs an external CLI agent in the environment and
//!   collects the resulting working-tree diff

pub mod baseline;
pub mod command;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::execution::ExecutionEnvironment;
use crate::swe::CodingAgentDataPoint;

pub use baseline::{GoldPatchAgent, NullAgent};
pub use command::CommandAgent;

/// Supported agent types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    #[default]
    Gold,
    Null,
    Command,
}

impl AgentType {
    pub fn display_name(&self) -> &'static str {
        match self {
            AgentType::Gold => "gold",
            AgentType::Null => "null",
            AgentType::Command => "command",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl std::str::FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gold" | "oracle" => Ok(AgentType::Gold),
            "null" | "empty" | "none" => Ok(AgentType::Null),
            "command" | "cli" => Ok(AgentType::Command),
            other => Err(format!("Unknown agent type: {}", other)),
        }
    }
}

/// A proposed fix.
#[derive(Debug, Clone, Default)]
pub struct CandidatePatch {
    /// Unified diff against the base commit; may be empty.
    pub diff: String,
    pub duration: Duration,
    /// Tail of whatever the agent printed.
    pub log: String,
}

impl CandidatePatch {
    pub fn new(diff: impl Into<String>) -> Self {
        Self {
            diff: diff.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.diff.trim().is_empty()
    }
}

/// Error type for agent operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("Agent needs an environment but none was provided")]
    NoEnvironment,

    #[error("Failed to collect agent changes: {0}")]
    Collect(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Proposes a candidate patch for one data point.
#[async_trait]
pub trait PatchAgent: Send + Sync {
    fn name(&self) -> &str;

    /// Whether [`propose_patch`](Self::propose_patch) needs a provisioned
    /// environment. Agents that don't are never given one.
    fn needs_environment(&self) -> bool {
        true
    }

    async fn propose_patch(
        &self,
        data_point: &CodingAgentDataPoint,
        env: Option<&ExecutionEnvironment>,
    ) -> Result<CandidatePatch, AgentError>;
}

/// Creates an agent for the given type. `command` is the CLI template used
/// by [`AgentType::Command`].
pub fn create_agent(
    agent_type: AgentType,
    command: Option<&str>,
) -> Result<Box<dyn PatchAgent>, AgentError> {
    match agent_type {
        AgentType::Gold => Ok(Box::new(GoldPatchAgent)),
        AgentType::Null => Ok(Box::new(NullAgent)),
        AgentType::Command => {
            let command = command
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| AgentError::Config("the command agent needs a command".to_string()))?;
            Ok(Box::new(CommandAgent::new(command)))
        }
    }
}
