//! Issue to pull request linking.
//!
//! A pull request is a *strong* candidate for an issue when it closes the
//! issue through a closing keyword (`fixes #12`, `closes owner/repo#12`,
//! `resolved https://github.com/owner/repo/issues/12`) in its title, body
//! or commit messages, or when its merge commit is the one that closed the
//! issue. Anything else that points at the issue (timeline cross-references,
//! bare `#12` mentions) is a *weak* candidate and only linked when free-text
//! linking is enabled. Ambiguity is reported, never resolved by guessing.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;

use crate::error::{FetchError, LinkError};
use crate::swe::github::IssueTracker;
use crate::swe::{Issue, LinkedPullRequest, PatchSet, PullRequestSummary, RepoRef, TimelineReference};

#[derive(Debug, Clone)]
pub struct LinkerConfig {
    /// Link a single merged PR that only mentions the issue.
    pub allow_free_text: bool,
    /// Upper bound on weak candidates kept per issue. Strong candidates
    /// are never dropped.
    pub max_candidates: usize,
    /// Upper bound on pull requests fetched per issue.
    pub max_fetched: usize,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            allow_free_text: false,
            max_candidates: 20,
            max_fetched: 100,
        }
    }
}

impl LinkerConfig {
    pub fn with_free_text(mut self, allow: bool) -> Self {
        self.allow_free_text = allow;
        self
    }

    pub fn with_max_candidates(mut self, max: usize) -> Self {
        self.max_candidates = max.max(1);
        self
    }

    pub fn with_max_fetched(mut self, max: usize) -> Self {
        self.max_fetched = max.max(1);
        self
    }
}

/// A pull request considered for an issue, with the evidence gathered for it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub pull: PullRequestSummary,
    /// The issue was closed by this PR's merge commit.
    pub closed_by_merge: bool,
}

pub struct PrLinker {
    repo: RepoRef,
    config: LinkerConfig,
    closing: Regex,
    mention: Regex,
}

impl PrLinker {
    pub fn new(repo: RepoRef, config: LinkerConfig) -> Result<Self, regex::Error> {
        let closing = Regex::new(
            r"(?i)\b(?:close[sd]?|fix(?:e[sd])?|resolve[sd]?)\b:?\s+(?:(?P<repo>[\w.-]+/[\w.-]+)?#(?P<num>\d+)\b|https?://github\.com/(?P<url_repo>[\w.-]+/[\w.-]+)/issues/(?P<url_num>\d+)\b)",
        )?;
        let mention = Regex::new(r"(?:(?P<repo>[\w.-]+/[\w.-]+)|\B)#(?P<num>\d+)\b")?;
        Ok(Self {
            repo,
            config,
            closing,
            mention,
        })
    }

    pub fn config(&self) -> &LinkerConfig {
        &self.config
    }

    /// Same-repository issues closed by keyword in `text`.
    pub fn closing_references(&self, text: &str) -> BTreeSet<u64> {
        let mut found = BTreeSet::new();
        for caps in self.closing.captures_iter(text) {
            let (repo, num) = match (caps.name("num"), caps.name("url_num")) {
                (Some(num), _) => (caps.name("repo"), num),
                (None, Some(num)) => (caps.name("url_repo"), num),
                (None, None) => continue,
            };
            if repo.is_some_and(|r| !self.repo.is(r.as_str())) {
                continue;
            }
            if let Ok(n) = num.as_str().parse() {
                found.insert(n);
            }
        }
        found
    }

    /// Same-repository `#N` references in `text`, with or without keywords.
    fn mentions(&self, text: &str) -> BTreeSet<u64> {
        self.mention
            .captures_iter(text)
            .filter(|caps| caps.name("repo").is_none_or(|r| self.repo.is(r.as_str())))
            .filter_map(|caps| caps.name("num")?.as_str().parse().ok())
            .collect()
    }

    /// Issues the pull request closes by keyword anywhere in its text.
    pub fn issues_closed_by(&self, pull: &PullRequestSummary) -> BTreeSet<u64> {
        let mut closes = self.closing_references(&pull.title);
        closes.extend(self.closing_references(&pull.body));
        for message in &pull.commit_messages {
            closes.extend(self.closing_references(message));
        }
        closes
    }

    fn mentions_issue(&self, pull: &PullRequestSummary, issue: u64) -> bool {
        std::iter::once(&pull.title)
            .chain(std::iter::once(&pull.body))
            .chain(&pull.commit_messages)
            .any(|text| self.mentions(text).contains(&issue))
    }

    fn is_strong(&self, issue: u64, candidate: &Candidate) -> bool {
        candidate.closed_by_merge || self.issues_closed_by(&candidate.pull).contains(&issue)
    }

    /// Candidate numbers in fetch order: indexed closers first, then
    /// timeline references newest first, cut at `max_fetched`.
    fn fetch_order(&self, issue: u64, indexed: &BTreeSet<u64>, referenced: &BTreeSet<u64>) -> Vec<u64> {
        let mut order: Vec<u64> = indexed.iter().rev().copied().collect();
        order.extend(referenced.iter().rev().filter(|n| !indexed.contains(n)));
        if order.len() > self.config.max_fetched {
            tracing::warn!(
                issue = issue,
                candidates = order.len(),
                kept = self.config.max_fetched,
                indexed = indexed.len(),
                "Too many candidate pull requests, fetching indexed closers and the most recent"
            );
            order.truncate(self.config.max_fetched);
        }
        order
    }

    /// Keep every strong candidate and at most `max_candidates` weak ones,
    /// preferring weak ones whose text names the issue, then the newest.
    fn retain_candidates(&self, issue: u64, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let (mut kept, mut weak): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|c| self.is_strong(issue, c));
        if weak.len() > self.config.max_candidates {
            tracing::warn!(
                issue = issue,
                strong = kept.len(),
                weak = weak.len(),
                kept = self.config.max_candidates,
                "Too many weak candidate pull requests, dropping the oldest"
            );
            weak.sort_by_key(|c| Reverse((self.mentions_issue(&c.pull, issue), c.pull.number)));
            weak.truncate(self.config.max_candidates);
        }
        kept.extend(weak);
        kept.sort_by_key(|c| c.pull.number);
        kept
    }

    /// Decide which candidate, if any, resolved `issue`.
    pub fn resolve(&self, issue: u64, candidates: Vec<Candidate>) -> Result<Candidate, LinkError> {
        let merged: Vec<(Candidate, BTreeSet<u64>)> = candidates
            .into_iter()
            .filter(|c| c.pull.merged)
            .map(|c| {
                let closes = self.issues_closed_by(&c.pull);
                (c, closes)
            })
            .collect();

        let (strong, weak): (Vec<_>, Vec<_>) = merged
            .into_iter()
            .partition(|(c, closes)| c.closed_by_merge || closes.contains(&issue));

        let chosen = match strong.len() {
            1 => strong.into_iter().next(),
            0 => None,
            _ => {
                return Err(LinkError::Ambiguous {
                    issue,
                    candidates: strong.iter().map(|(c, _)| c.pull.number).collect(),
                    detail: "several merged pull requests close it".to_string(),
                })
            }
        };

        let (candidate, mut closes) = match chosen {
            Some(found) => found,
            None if weak.is_empty() => return Err(LinkError::NoMergedPullRequest { issue }),
            None if self.config.allow_free_text && weak.len() == 1 => {
                weak.into_iter().next().ok_or(LinkError::NoMergedPullRequest { issue })?
            }
            None => {
                return Err(LinkError::LowConfidence {
                    issue,
                    candidates: weak.iter().map(|(c, _)| c.pull.number).collect(),
                })
            }
        };

        closes.insert(issue);
        if closes.len() > 1 {
            return Err(LinkError::Ambiguous {
                issue,
                candidates: vec![candidate.pull.number],
                detail: format!("pull request closes issues {:?}", closes),
            });
        }
        Ok(candidate)
    }

    /// Find the merged pull request that resolved `issue` and fetch its diff.
    ///
    /// `extra` are candidate numbers discovered elsewhere, typically from a
    /// [`PullRequestIndex`] built over the repository's PR history.
    pub async fn link(
        &self,
        tracker: &dyn IssueTracker,
        issue: &Issue,
        extra: &[u64],
    ) -> Result<LinkedPullRequest, LinkError> {
        let number = issue.number;
        let unresolved = |source: FetchError| LinkError::Unresolved { issue: number, source };

        let timeline = tracker.issue_timeline(number).await.map_err(unresolved)?;

        let indexed: BTreeSet<u64> = extra.iter().copied().collect();
        let mut referenced = BTreeSet::new();
        let mut closing_commits = BTreeSet::new();
        for event in &timeline {
            match event {
                TimelineReference::CrossReferenced { repo, pull } if self.repo.is(repo) => {
                    referenced.insert(*pull);
                }
                TimelineReference::Closed { commit } => {
                    closing_commits.insert(commit.as_str());
                }
                _ => {}
            }
        }

        let order = self.fetch_order(number, &indexed, &referenced);
        let mut candidates = Vec::with_capacity(order.len());
        for pull in order {
            let summary = tracker.pull_request(pull).await.map_err(unresolved)?;
            let closed_by_merge = summary
                .merge_commit_sha
                .as_deref()
                .is_some_and(|sha| closing_commits.contains(sha));
            candidates.push(Candidate {
                pull: summary,
                closed_by_merge,
            });
        }
        let candidates = self.retain_candidates(number, candidates);

        let chosen = self.resolve(number, candidates)?;
        let pull = chosen.pull.number;
        let raw = tracker.pull_request_diff(pull).await.map_err(unresolved)?;
        let diff = PatchSet::parse(&raw).map_err(|source| LinkError::MalformedDiff { pull, source })?;

        tracing::debug!(issue = number, pull = pull, files = diff.files.len(), "Linked issue");
        Ok(LinkedPullRequest {
            issue: number,
            pull: chosen.pull,
            diff,
        })
    }
}

/// Issue number to candidate pull requests, built from the closed PR history.
///
/// The timeline only shows cross-references GitHub recorded; scanning PR
/// titles and bodies catches closing keywords the timeline misses.
#[derive(Debug, Clone, Default)]
pub struct PullRequestIndex {
    by_issue: BTreeMap<u64, BTreeSet<u64>>,
}

impl PullRequestIndex {
    /// Scan up to `max_pages` pages of closed pull requests.
    pub async fn build(
        linker: &PrLinker,
        tracker: &dyn IssueTracker,
        max_pages: u32,
    ) -> Result<Self, FetchError> {
        let mut index = Self::default();
        for page in 1..=max_pages {
            let batch = tracker.list_pull_requests(page).await?;
            for pull in batch.pulls.iter().filter(|p| p.merged) {
                index.record(linker, pull);
            }
            if !batch.has_more {
                break;
            }
        }
        tracing::info!(
            issues = index.by_issue.len(),
            pages = max_pages,
            "Indexed pull request history"
        );
        Ok(index)
    }

    pub fn record(&mut self, linker: &PrLinker, pull: &PullRequestSummary) {
        for issue in linker.issues_closed_by(pull) {
            self.by_issue.entry(issue).or_default().insert(pull.number);
        }
    }

    pub fn candidates_for(&self, issue: u64) -> Vec<u64> {
        self.by_issue
            .get(&issue)
            .map(|pulls| pulls.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_issue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_issue.is_empty()
    }
}
