//! Issue-to-fix dataset mining.
//!
//! The pipeline walks a repository's closed issues, links each one to the
//! single merged pull request that resolved it, splits that PR's diff into a
//! production patch and a test patch, and emits a validated
//! [`CodingAgentDataPoint`] per issue:
//!
//! - [`github`]: paginated issue tracker client and the [`IssueTracker`] seam
//! - [`linker`]: closing-keyword and timeline based PR linking
//! - [`extractor`]: gold patch partitioning by path prefix
//! - [`assembler`]: base revision resolution and record construction
//! - [`dataset`]: de-duplicating JSONL accumulator
//! - [`pipeline`]: bounded-concurrency orchestration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::runner::frameworks::TestFramework;

pub mod assembler;
pub mod dataset;
pub mod diff;
pub mod extractor;
pub mod github;
pub mod input_validation;
pub mod linker;
pub mod pipeline;
pub mod profile;
pub mod progress;
pub mod test_ids;

pub use assembler::{last_release_before, BaseOrigin, DataPointAssembler, ResolvedBase};
pub use dataset::{DatasetAccumulator, InsertOutcome};
pub use diff::{FileDiff, Hunk, PatchSet};
pub use extractor::{GoldPatch, GoldPatchExtractor, GoldPatchExtractorConfig, PathPrefixSet};
pub use github::{GithubClient, IssueQuery, IssueTracker};
pub use input_validation::{validate_git_ref, validate_relative_path, validate_repo_name};
pub use linker::{LinkerConfig, PrLinker};
pub use pipeline::{DatasetPipeline, PipelineConfig, PipelineReport};
pub use profile::RepoProfile;
pub use progress::{ProgressCounters, ProgressMonitor, ProgressSnapshot};

/// A repository in `owner/name` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn parse(full_name: &str) -> anyhow::Result<Self> {
        validate_repo_name(full_name)?;
        let (owner, name) = full_name
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("expected owner/repo, got '{}'", full_name))?;
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// `owner__name-<issue>`, the stable data point identifier.
    pub fn instance_id(&self, issue: u64) -> String {
        format!("{}__{}-{}", self.owner, self.name, issue)
    }

    pub fn clone_url(&self) -> String {
        format!("https://github.com/{}/{}.git", self.owner, self.name)
    }

    /// Case-insensitive comparison against an `owner/name` string.
    pub fn is(&self, full_name: &str) -> bool {
        full_name.eq_ignore_ascii_case(&self.full_name())
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl std::str::FromStr for RepoRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Tracker records
// ---------------------------------------------------------------------------

/// A comment on an issue thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueComment {
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// An issue as fetched from the tracker. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub state: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub html_url: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comments: Vec<IssueComment>,
}

impl Issue {
    /// Title and body as the task description handed to an agent.
    pub fn problem_statement(&self) -> String {
        let body = self.body.trim();
        if body.is_empty() {
            self.title.trim().to_string()
        } else {
            format!("{}\n\n{}", self.title.trim(), body)
        }
    }
}

/// An event on an issue's timeline that can point at a fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TimelineReference {
    /// A pull request (possibly in another repository) mentioned the issue.
    CrossReferenced { repo: String, pull: u64 },
    /// The issue was closed by a commit.
    Closed { commit: String },
    /// A commit mentioned the issue.
    Referenced { commit: String },
}

/// The fields of a pull request the linker and assembler need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestSummary {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub state: String,
    pub merged: bool,
    pub merged_at: Option<DateTime<Utc>>,
    pub merge_commit_sha: Option<String>,
    pub base_sha: String,
    pub head_sha: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub commit_messages: Vec<String>,
}

/// A review comment left on a pull request's diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub author: String,
    pub body: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub diff_hunk: String,
}

/// A commit with the data needed to validate a base revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub parents: Vec<String>,
    pub committed_at: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
}

/// A published (or draft) release of the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub tag_name: String,
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
}

/// The merged pull request that resolved exactly one issue.
#[derive(Debug, Clone)]
pub struct LinkedPullRequest {
    pub issue: u64,
    pub pull: PullRequestSummary,
    pub diff: PatchSet,
}

impl LinkedPullRequest {
    pub fn number(&self) -> u64 {
        self.pull.number
    }

    pub fn merge_commit(&self) -> Option<&str> {
        self.pull.merge_commit_sha.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Data point
// ---------------------------------------------------------------------------

/// One benchmark item: an issue, the repository state before its fix, the
/// gold fix split into production and test parts, and the tests that must
/// pass once the issue is resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodingAgentDataPoint {
    pub instance_id: String,
    pub repo: String,
    pub issue_number: u64,
    pub pull_number: u64,
    pub base_commit: String,
    pub merge_commit: String,
    pub problem_statement: String,
    #[serde(default)]
    pub hints_text: String,
    /// Production part of the gold patch.
    pub patch: String,
    pub test_patch: String,
    pub expected_pass: Vec<String>,
    pub test_framework: TestFramework,
    #[serde(default)]
    pub test_command: Option<String>,
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    /// Tag of the last stable release published before the merge.
    #[serde(default)]
    pub version: Option<String>,
    /// Revision whose dependencies the evaluation environment installs.
    #[serde(default)]
    pub environment_setup_commit: String,
    /// SHA-256 over the patch and test patch.
    pub digest: String,
}

impl CodingAgentDataPoint {
    /// Hex SHA-256 of `patch`, a NUL separator and `test_patch`.
    pub fn compute_digest(patch: &str, test_patch: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(patch.as_bytes());
        hasher.update([0u8]);
        hasher.update(test_patch.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn digest_matches(&self) -> bool {
        self.digest == Self::compute_digest(&self.patch, &self.test_patch)
    }

    pub fn gold_patch(&self) -> Result<PatchSet, crate::error::DiffParseError> {
        PatchSet::parse(&self.patch)
    }

    pub fn test_patch_set(&self) -> Result<PatchSet, crate::error::DiffParseError> {
        PatchSet::parse(&self.test_patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_ref_parse_and_instance_id() {
        let repo = RepoRef::parse("octo-org/widgets").unwrap();
        assert_eq!(repo.owner, "octo-org");
        assert_eq!(repo.instance_id(42), "octo-org__widgets-42");
        assert_eq!(repo.to_string(), "octo-org/widgets");
        assert!(repo.is("Octo-Org/Widgets"));
        assert!(RepoRef::parse("bad name/x").is_err());
    }

    #[test]
    fn test_problem_statement_joins_title_and_body() {
        let issue = Issue {
            number: 1,
            title: "Crash on empty input ".to_string(),
            body: "\nSteps:\n1. run\n".to_string(),
            state: "closed".to_string(),
            labels: vec![],
            author: "alice".to_string(),
            html_url: String::new(),
            created_at: Utc::now(),
            closed_at: None,
            comments: vec![],
        };
        assert_eq!(
            issue.problem_statement(),
            "Crash on empty input\n\nSteps:\n1. run"
        );
        let bare = Issue {
            body: String::new(),
            ..issue
        };
        assert_eq!(bare.problem_statement(), "Crash on empty input");
    }

    #[test]
    fn test_digest_is_stable_and_separates_fields() {
        let a = CodingAgentDataPoint::compute_digest("ab", "c");
        let b = CodingAgentDataPoint::compute_digest("a", "bc");
        assert_ne!(a, b);
        assert_eq!(a, CodingAgentDataPoint::compute_digest("ab", "c"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_timeline_reference_serde() {
        let event = TimelineReference::CrossReferenced {
            repo: "o/r".to_string(),
            pull: 7,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"event":"cross_referenced","repo":"o/r","pull":7}"#);
    }
}
