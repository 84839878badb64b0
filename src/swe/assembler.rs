//! Data point assembly: base revision resolution and record construction.

use chrono::{DateTime, Utc};

use crate::error::{AssemblyError, FetchError};
use crate::runner::frameworks::TestFramework;
use crate::swe::extractor::GoldPatch;
use crate::swe::github::IssueTracker;
use crate::swe::test_ids::expected_test_ids;
use crate::swe::{
    validate_git_ref, CodingAgentDataPoint, CommitInfo, Issue, LinkedPullRequest, Release, RepoRef,
    ReviewComment,
};

const HINT_SEPARATOR_WIDTH: usize = 100;

/// Where the base revision was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseOrigin {
    /// The single parent of a merge or squash commit.
    MergeParent,
    /// The pull request's base branch head, for rebase merges where the
    /// merge commit's parent is itself one of the rebased commits.
    PullBase,
}

/// The merge commit and the revision the data point is based on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBase {
    pub merge: CommitInfo,
    pub base: CommitInfo,
    pub origin: BaseOrigin,
}

/// A rebase merge replays every PR commit onto the base branch, so the
/// merge commit is the last replayed commit and carries its message.
fn is_rebase_merge(merge: &CommitInfo, linked: &LinkedPullRequest) -> bool {
    let commits = &linked.pull.commit_messages;
    commits.len() > 1
        && commits
            .last()
            .is_some_and(|last| last.trim() == merge.message.trim())
}

/// Last stable release published at or before `at`.
pub fn last_release_before(releases: &[Release], at: DateTime<Utc>) -> Option<&Release> {
    releases
        .iter()
        .filter(|r| !r.draft && !r.prerelease)
        .filter_map(|r| r.published_at.filter(|p| *p <= at).map(|p| (p, r)))
        .max_by_key(|(published, _)| *published)
        .map(|(_, r)| r)
}

#[derive(Debug, Clone)]
pub struct DataPointAssembler {
    repo: RepoRef,
    framework: TestFramework,
    test_command: Option<String>,
    include_hints: bool,
    require_expected_tests: bool,
    releases: Vec<Release>,
}

impl DataPointAssembler {
    pub fn new(repo: RepoRef, framework: TestFramework) -> Self {
        Self {
            repo,
            framework,
            test_command: None,
            include_hints: true,
            require_expected_tests: true,
            releases: Vec::new(),
        }
    }

    /// Releases used to stamp each record with the version it was fixed
    /// against.
    pub fn with_releases(mut self, releases: Vec<Release>) -> Self {
        self.releases = releases;
        self
    }

    pub fn with_test_command(mut self, command: Option<String>) -> Self {
        self.test_command = command;
        self
    }

    pub fn with_hints(mut self, include: bool) -> Self {
        self.include_hints = include;
        self
    }

    /// Accept data points whose test patch names no recognisable test.
    pub fn with_require_expected_tests(mut self, require: bool) -> Self {
        self.require_expected_tests = require;
        self
    }

    /// Resolve the base revision: the single parent of the merge commit,
    /// or the pull request's base head when the PR was rebase-merged.
    pub async fn resolve_base(
        &self,
        tracker: &dyn IssueTracker,
        linked: &LinkedPullRequest,
    ) -> Result<ResolvedBase, AssemblyError> {
        let merge_sha = linked
            .merge_commit()
            .ok_or(AssemblyError::MissingMergeCommit {
                pull: linked.number(),
            })?;

        let merge = tracker
            .commit(merge_sha)
            .await
            .map_err(|e| unreachable_or_fetch(merge_sha, e))?;

        let (base_sha, origin) = match merge.parents.as_slice() {
            [_] if is_rebase_merge(&merge, linked) => {
                let base_sha = linked.pull.base_sha.clone();
                validate_git_ref(&base_sha).map_err(|e| AssemblyError::UnreachableBase {
                    commit: base_sha.clone(),
                    reason: e.to_string(),
                })?;
                tracing::debug!(
                    pull = linked.number(),
                    commits = linked.pull.commit_messages.len(),
                    base = %base_sha,
                    "Rebase merge, using the pull request base"
                );
                (base_sha, BaseOrigin::PullBase)
            }
            [parent] => (parent.clone(), BaseOrigin::MergeParent),
            [] => {
                return Err(AssemblyError::UnreachableBase {
                    commit: merge.sha.clone(),
                    reason: "merge commit has no parent".to_string(),
                })
            }
            parents => {
                return Err(AssemblyError::MultipleParents {
                    commit: merge.sha.clone(),
                    parents: parents.len(),
                })
            }
        };

        let base = tracker
            .commit(&base_sha)
            .await
            .map_err(|e| unreachable_or_fetch(&base_sha, e))?;

        let merged_at = linked.pull.merged_at.unwrap_or(merge.committed_at);
        if base.committed_at > merged_at {
            return Err(AssemblyError::BaseAfterMerge {
                base: base.sha.clone(),
                base_date: base.committed_at.to_rfc3339(),
                merged_at: merged_at.to_rfc3339(),
            });
        }

        Ok(ResolvedBase { merge, base, origin })
    }

    /// PR body, issue comments posted before the PR was opened, then review
    /// comments, separated by a rule.
    pub fn hints_text(
        &self,
        issue: &Issue,
        linked: &LinkedPullRequest,
        reviews: &[ReviewComment],
    ) -> String {
        if !self.include_hints {
            return String::new();
        }
        let mut parts = Vec::new();
        let body = linked.pull.body.trim();
        if !body.is_empty() {
            parts.push(body.to_string());
        }
        for comment in &issue.comments {
            if comment.created_at < linked.pull.created_at && !comment.body.trim().is_empty() {
                parts.push(comment.body.trim().to_string());
            }
        }
        for review in reviews {
            let comment = review.body.trim();
            if comment.is_empty() {
                continue;
            }
            if review.diff_hunk.is_empty() {
                parts.push(comment.to_string());
            } else {
                parts.push(format!("{}\n{}", review.diff_hunk.trim_end(), comment));
            }
        }
        let separator = format!("\n{}\n", "-".repeat(HINT_SEPARATOR_WIDTH));
        parts.join(&separator)
    }

    /// Build and validate the record from already-resolved parts.
    pub fn build(
        &self,
        issue: &Issue,
        linked: &LinkedPullRequest,
        gold: &GoldPatch,
        base: &ResolvedBase,
        reviews: &[ReviewComment],
    ) -> Result<CodingAgentDataPoint, AssemblyError> {
        let expected_pass = expected_test_ids(self.framework, &gold.tests);
        if expected_pass.is_empty() && self.require_expected_tests {
            return Err(AssemblyError::NoExpectedTests {
                issue: issue.number,
            });
        }

        let patch = gold.production.render();
        let test_patch = gold.tests.render();
        let digest = CodingAgentDataPoint::compute_digest(&patch, &test_patch);
        let merged_at = linked.pull.merged_at.unwrap_or(base.merge.committed_at);
        let version = last_release_before(&self.releases, merged_at).map(|r| r.tag_name.clone());

        Ok(CodingAgentDataPoint {
            instance_id: self.repo.instance_id(issue.number),
            repo: self.repo.full_name(),
            issue_number: issue.number,
            pull_number: linked.number(),
            base_commit: base.base.sha.clone(),
            merge_commit: base.merge.sha.clone(),
            problem_statement: issue.problem_statement(),
            hints_text: self.hints_text(issue, linked, reviews),
            patch,
            test_patch,
            expected_pass,
            test_framework: self.framework,
            test_command: self.test_command.clone(),
            created_at: issue.created_at,
            merged_at: linked.pull.merged_at,
            version,
            environment_setup_commit: base.base.sha.clone(),
            digest,
        })
    }

    /// Resolve the base, gather hints and build the record.
    pub async fn assemble(
        &self,
        tracker: &dyn IssueTracker,
        issue: &Issue,
        linked: &LinkedPullRequest,
        gold: &GoldPatch,
    ) -> Result<CodingAgentDataPoint, AssemblyError> {
        let base = self.resolve_base(tracker, linked).await?;
        let reviews = if self.include_hints {
            tracker.review_comments(linked.number()).await?
        } else {
            Vec::new()
        };
        self.build(issue, linked, gold, &base, &reviews)
    }
}

/// A commit GitHub refuses to serve is unreachable; a transient failure
/// that survived every retry stays a fetch error.
fn unreachable_or_fetch(commit: &str, error: FetchError) -> AssemblyError {
    match error {
        FetchError::Fatal { message, .. } => AssemblyError::UnreachableBase {
            commit: commit.to_string(),
            reason: message,
        },
        transient => AssemblyError::Fetch(transient),
    }
}
