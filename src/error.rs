//! Error types for swe-harvest operations.
//!
//! Each stage of dataset construction and evaluation has its own error
//! enum so that per-item failures can be classified, counted and skipped
//! without aborting the whole run.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while talking to the issue tracker.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Rate limiting, 5xx responses and transport hiccups. Safe to retry.
    #[error("Transient failure during {operation}: {message}")]
    Transient {
        operation: String,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Anything a retry cannot fix (404, bad credentials, undecodable body).
    #[error("Fetch failed during {operation}: {message}")]
    Fatal { operation: String, message: String },
}

impl FetchError {
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn fatal(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn operation(&self) -> &str {
        match self {
            Self::Transient { operation, .. } | Self::Fatal { operation, .. } => operation,
        }
    }
}

/// Errors produced when a unified diff cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffParseError {
    #[error("line {line}: malformed hunk header '{header}'")]
    BadHunkHeader { line: usize, header: String },

    #[error("line {line}: hunk '{header}' ends before its declared length")]
    TruncatedHunk { line: usize, header: String },

    #[error("line {line}: hunk found outside of a file section")]
    OrphanHunk { line: usize },

    #[error("line {line}: unexpected line '{content}' inside hunk")]
    UnexpectedLine { line: usize, content: String },
}

/// Reasons an issue could not be tied to exactly one merged pull request.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("Issue #{issue} is ambiguous ({detail}): candidates {candidates:?}")]
    Ambiguous {
        issue: u64,
        candidates: Vec<u64>,
        detail: String,
    },

    #[error("Issue #{issue} has no merged pull request closing it")]
    NoMergedPullRequest { issue: u64 },

    #[error("Issue #{issue} is only mentioned without a closing keyword by {candidates:?}")]
    LowConfidence { issue: u64, candidates: Vec<u64> },

    #[error("Issue #{issue} could not be resolved: {source}")]
    Unresolved { issue: u64, source: FetchError },

    #[error("Pull request #{pull} has an unparseable diff: {source}")]
    MalformedDiff { pull: u64, source: DiffParseError },
}

/// Reasons a linked pull request does not yield a usable gold patch.
#[derive(Debug, Clone, Error)]
pub enum GoldPatchError {
    #[error("Pull request #{pull} changes no production files")]
    EmptyProduction { pull: u64 },

    #[error("Pull request #{pull} changes no test files")]
    EmptyTests { pull: u64 },

    #[error("Malformed diff: {0}")]
    MalformedDiff(#[from] DiffParseError),
}

/// Reasons an issue is rejected while building a data point.
#[derive(Debug, Clone, Error)]
pub enum AssemblyError {
    #[error("Merge commit {commit} has {parents} parents")]
    MultipleParents { commit: String, parents: usize },

    #[error("Base revision for {commit} is unreachable: {reason}")]
    UnreachableBase { commit: String, reason: String },

    #[error("Base commit {base} ({base_date}) is dated after the merge at {merged_at}")]
    BaseAfterMerge {
        base: String,
        base_date: String,
        merged_at: String,
    },

    #[error("Pull request #{pull} has no merge commit")]
    MissingMergeCommit { pull: u64 },

    #[error("Issue #{issue} has no identifiable expected-pass tests")]
    NoExpectedTests { issue: u64 },

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    GoldPatch(#[from] GoldPatchError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl AssemblyError {
    /// Stable short label used when tallying rejections.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MultipleParents { .. } => "multiple_parents",
            Self::UnreachableBase { .. } => "unreachable_base",
            Self::BaseAfterMerge { .. } => "base_after_merge",
            Self::MissingMergeCommit { .. } => "missing_merge_commit",
            Self::NoExpectedTests { .. } => "no_expected_tests",
            Self::Link(LinkError::Ambiguous { .. }) => "ambiguous_link",
            Self::Link(LinkError::NoMergedPullRequest { .. }) => "no_merged_pull_request",
            Self::Link(LinkError::LowConfidence { .. }) => "low_confidence_link",
            Self::Link(LinkError::Unresolved { .. }) => "unresolved",
            Self::Link(LinkError::MalformedDiff { .. }) => "malformed_diff",
            Self::GoldPatch(GoldPatchError::EmptyProduction { .. }) => "empty_production",
            Self::GoldPatch(GoldPatchError::EmptyTests { .. }) => "empty_tests",
            Self::GoldPatch(GoldPatchError::MalformedDiff(_)) => "malformed_diff",
            Self::Fetch(_) => "fetch",
        }
    }
}

/// Errors that can occur during Docker operations.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Failed to pull image: {0}")]
    ImagePull(String),

    #[error("Docker run failed: {0}")]
    RunFailed(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Infrastructure failures while running a command in an environment.
///
/// A command that runs and exits non-zero (or times out) is not an error;
/// this covers the cases where nothing could be run at all.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Failed to spawn '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("Environment '{0}' has already been released")]
    Released(String),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while provisioning an execution environment.
#[derive(Debug, Error)]
pub enum EnvironmentSetupError {
    #[error("Failed to prepare workspace: {0}")]
    Workspace(String),

    #[error("Checkout of {revision} failed: {message}")]
    Checkout { revision: String, message: String },

    #[error("Image '{image}' is unavailable: {message}")]
    MissingImage { image: String, message: String },

    #[error("Failed to start environment: {0}")]
    Provision(String),

    #[error("Install command '{command}' exited with {exit_code}: {output}")]
    Install {
        command: String,
        exit_code: i64,
        output: String,
    },

    #[error("Install command '{command}' timed out after {seconds}s")]
    InstallTimeout { command: String, seconds: u64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Setup cancelled")]
    Cancelled,

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A hunk that could not be located in the target file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Patch does not apply to '{path}'{}: {reason}", describe_hunk(.hunk_index, .header))]
pub struct PatchConflictError {
    pub path: String,
    /// 1-based hunk position within the file section; `None` for file-level
    /// conflicts such as creating a file that already exists.
    pub hunk_index: Option<usize>,
    pub header: Option<String>,
    pub reason: String,
}

fn describe_hunk(index: &Option<usize>, header: &Option<String>) -> String {
    match (index, header) {
        (Some(i), Some(h)) => format!(" at hunk #{} ({})", i, h.trim_end()),
        (Some(i), None) => format!(" at hunk #{}", i),
        _ => String::new(),
    }
}

/// Errors returned by the patch applicator.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error(transparent)]
    Conflict(#[from] PatchConflictError),

    #[error("Malformed patch: {0}")]
    Malformed(#[from] DiffParseError),

    #[error("Path escapes the working tree: {0}")]
    UnsafePath(String),

    #[error("Cannot apply change to '{path}': {reason}")]
    Unsupported { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by the test runner.
#[derive(Debug, Error)]
pub enum TestRunError {
    #[error("Test command timed out after {seconds}s")]
    Timeout { seconds: u64, partial_output: String },

    #[error("Failed to start test command: {0}")]
    Spawn(String),

    #[error(transparent)]
    Exec(#[from] ExecError),
}
