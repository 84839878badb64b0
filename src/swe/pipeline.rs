//! Dataset construction: fetch issues, link, extract, assemble.
//!
//! Issues are collected from the tracker page by page, then processed with
//! bounded concurrency. Per-issue failures are isolated and tallied; only a
//! failure to fetch anything at all aborts the run. Results are inserted in
//! issue order so the dataset is identical regardless of completion order.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::error::{AssemblyError, LinkError};
use crate::swe::assembler::DataPointAssembler;
use crate::swe::dataset::{DatasetAccumulator, InsertOutcome};
use crate::swe::extractor::GoldPatchExtractor;
use crate::swe::github::{issue_stream, IssueQuery, IssueTracker};
use crate::swe::linker::{LinkerConfig, PrLinker, PullRequestIndex};
use crate::swe::profile::RepoProfile;
use crate::swe::progress::{ProgressCounters, ProgressMonitor};
use crate::swe::{CodingAgentDataPoint, Issue, Release};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    CollectionStarted { start_page: u32, max_issues: Option<usize> },
    IssueSkipped { issue: u64, kind: String, reason: String },
    DataPointEmitted { instance_id: String },
    PipelineCompleted { emitted: usize },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Issue ceiling for this run.
    pub max_issues: Option<usize>,
    /// Page to resume from.
    pub start_page: u32,
    pub concurrency: usize,
    /// Fetch comment threads for each issue.
    pub fetch_comments: bool,
    /// Pages of closed pull requests to scan for closing keywords; 0 relies
    /// on issue timelines alone.
    pub pull_history_pages: u32,
    pub progress_interval: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_issues: None,
            start_page: 1,
            concurrency: 4,
            fetch_comments: true,
            pull_history_pages: 0,
            progress_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl PipelineConfig {
    pub fn with_max_issues(mut self, max: Option<usize>) -> Self {
        self.max_issues = max;
        self
    }

    pub fn with_start_page(mut self, page: u32) -> Self {
        self.start_page = page.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_pull_history_pages(mut self, pages: u32) -> Self {
        self.pull_history_pages = pages;
        self
    }

    pub fn with_progress_interval(mut self, interval: Option<Duration>) -> Self {
        self.progress_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedIssue {
    pub issue: u64,
    pub kind: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineReport {
    pub fetched: usize,
    pub already_present: usize,
    /// Issue numbers of newly added data points, ascending.
    pub emitted: Vec<u64>,
    pub conflicting: usize,
    pub skipped: Vec<SkippedIssue>,
    /// Last page that produced issues; pass it as the start page to resume.
    pub last_page: Option<u32>,
    /// Set when paging stopped early because a later page failed.
    pub stream_error: Option<String>,
    pub cancelled: bool,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineReport {
    pub fn skipped_by_kind(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for skipped in &self.skipped {
            *counts.entry(skipped.kind.clone()).or_insert(0) += 1;
        }
        counts
    }
}

pub struct DatasetPipeline {
    tracker: Arc<dyn IssueTracker>,
    linker: PrLinker,
    extractor: GoldPatchExtractor,
    assembler: DataPointAssembler,
    counters: ProgressCounters,
}

impl DatasetPipeline {
    pub fn new(
        tracker: Arc<dyn IssueTracker>,
        profile: &RepoProfile,
        linker_config: LinkerConfig,
    ) -> anyhow::Result<Self> {
        let repo = tracker.repo().clone();
        if !repo.is(&profile.repo) {
            anyhow::bail!(
                "profile is for '{}' but the tracker serves '{}'",
                profile.repo,
                repo
            );
        }
        let linker =
            PrLinker::new(repo.clone(), linker_config).context("failed to compile link patterns")?;
        let extractor = GoldPatchExtractor::new(profile.extractor_config());
        let assembler = DataPointAssembler::new(repo, profile.test_framework)
            .with_test_command(profile.test_command.clone());
        Ok(Self {
            tracker,
            linker,
            extractor,
            assembler,
            counters: ProgressCounters::new(),
        })
    }

    pub fn with_assembler(mut self, assembler: DataPointAssembler) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn counters(&self) -> &ProgressCounters {
        &self.counters
    }

    /// Add every new, valid data point for the configured issue range to
    /// `dataset`. Issues already present are not reprocessed.
    pub async fn run(
        &self,
        config: &PipelineConfig,
        dataset: &mut DatasetAccumulator,
        cancel: &CancellationToken,
        event_tx: Option<Sender<PipelineEvent>>,
    ) -> anyhow::Result<PipelineReport> {
        let repo = self.tracker.repo().clone();
        emit(
            &event_tx,
            PipelineEvent::CollectionStarted {
                start_page: config.start_page,
                max_issues: config.max_issues,
            },
        )
        .await;

        let monitor = config.progress_interval.map(|interval| {
            ProgressMonitor::start(
                self.counters.clone(),
                config.max_issues.unwrap_or(0),
                interval,
            )
        });

        let mut report = PipelineReport::default();
        let issues = self.collect_issues(config, cancel, &mut report).await;
        let issues = match issues {
            Ok(issues) => issues,
            Err(err) => {
                if let Some(monitor) = monitor {
                    monitor.stop().await;
                }
                return Err(err);
            }
        };

        let mut pending = Vec::new();
        for issue in issues {
            if dataset.contains(issue.number) {
                report.already_present += 1;
            } else {
                pending.push(issue);
            }
        }
        tracing::info!(
            repo = %repo,
            fetched = report.fetched,
            already_present = report.already_present,
            pending = pending.len(),
            "Collected issues"
        );

        let index = self.build_index(config).await;
        let index = &index;
        let assembler = self.assembler.clone().with_releases(self.fetch_releases().await);
        let assembler = &assembler;
        let mut results: Vec<(u64, Result<CodingAgentDataPoint, AssemblyError>)> =
            futures::stream::iter(pending)
                .map(|issue| async move {
                    let number = issue.number;
                    (number, self.process_issue(config, issue, index, assembler).await)
                })
                .buffer_unordered(config.concurrency.max(1))
                .take_until(cancel.cancelled())
                .collect()
                .await;
        results.sort_by_key(|(number, _)| *number);

        for (number, result) in results {
            match result {
                Ok(record) => {
                    let instance_id = record.instance_id.clone();
                    match dataset.insert(record) {
                        InsertOutcome::Inserted => {
                            report.emitted.push(number);
                            emit(&event_tx, PipelineEvent::DataPointEmitted { instance_id }).await;
                        }
                        InsertOutcome::Duplicate => report.already_present += 1,
                        InsertOutcome::Conflicting => report.conflicting += 1,
                    }
                }
                Err(err) => {
                    let skipped = SkippedIssue {
                        issue: number,
                        kind: err.kind().to_string(),
                        reason: err.to_string(),
                    };
                    emit(
                        &event_tx,
                        PipelineEvent::IssueSkipped {
                            issue: number,
                            kind: skipped.kind.clone(),
                            reason: skipped.reason.clone(),
                        },
                    )
                    .await;
                    report.skipped.push(skipped);
                }
            }
        }

        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        report.cancelled = cancel.is_cancelled();
        report.finished_at = Some(Utc::now());

        emit(
            &event_tx,
            PipelineEvent::PipelineCompleted {
                emitted: report.emitted.len(),
            },
        )
        .await;
        tracing::info!(
            repo = %repo,
            emitted = report.emitted.len(),
            skipped = report.skipped.len(),
            conflicting = report.conflicting,
            cancelled = report.cancelled,
            "Dataset construction finished"
        );
        Ok(report)
    }

    async fn collect_issues(
        &self,
        config: &PipelineConfig,
        cancel: &CancellationToken,
        report: &mut PipelineReport,
    ) -> anyhow::Result<Vec<Issue>> {
        let mut query = IssueQuery::default().with_start_page(config.start_page);
        query.max_issues = config.max_issues;

        let stream = issue_stream(self.tracker.as_ref(), query).take_until(cancel.cancelled());
        futures::pin_mut!(stream);

        let mut issues = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok((page, issue)) => {
                    report.last_page = Some(page);
                    self.counters.fetched.fetch_add(1, Ordering::Relaxed);
                    issues.push(issue);
                }
                Err(err) if issues.is_empty() => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("failed to fetch issues from {}", self.tracker.repo())));
                }
                Err(err) => {
                    tracing::warn!(
                        repo = %self.tracker.repo(),
                        last_page = ?report.last_page,
                        error = %err,
                        "Issue paging stopped early"
                    );
                    report.stream_error = Some(err.to_string());
                    break;
                }
            }
        }
        report.fetched = issues.len();
        Ok(issues)
    }

    async fn build_index(&self, config: &PipelineConfig) -> PullRequestIndex {
        if config.pull_history_pages == 0 {
            return PullRequestIndex::default();
        }
        match PullRequestIndex::build(&self.linker, self.tracker.as_ref(), config.pull_history_pages)
            .await
        {
            Ok(index) => index,
            Err(err) => {
                tracing::warn!(error = %err, "Pull request history scan failed, using timelines only");
                PullRequestIndex::default()
            }
        }
    }

    /// Releases are optional metadata; a failed listing leaves records
    /// without a version.
    async fn fetch_releases(&self) -> Vec<Release> {
        match self.tracker.releases().await {
            Ok(releases) => {
                tracing::debug!(releases = releases.len(), "Fetched releases");
                releases
            }
            Err(err) => {
                tracing::warn!(error = %err, "Release listing failed, records carry no version");
                Vec::new()
            }
        }
    }

    async fn process_issue(
        &self,
        config: &PipelineConfig,
        mut issue: Issue,
        index: &PullRequestIndex,
        assembler: &DataPointAssembler,
    ) -> Result<CodingAgentDataPoint, AssemblyError> {
        let number = issue.number;
        let result = async {
            if config.fetch_comments {
                issue.comments = self
                    .tracker
                    .issue_comments(number)
                    .await
                    .map_err(|source| LinkError::Unresolved { issue: number, source })?;
            }
            let tracker = self.tracker.as_ref();

            let linked = self
                .linker
                .link(tracker, &issue, &index.candidates_for(number))
                .await?;
            self.counters.linked.fetch_add(1, Ordering::Relaxed);

            let gold = self.extractor.extract(&linked)?;
            self.counters.extracted.fetch_add(1, Ordering::Relaxed);

            assembler.assemble(tracker, &issue, &linked, &gold).await
        }
        .await;

        match &result {
            Ok(record) => {
                self.counters.assembled.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    issue = number,
                    pull = record.pull_number,
                    expected_tests = record.expected_pass.len(),
                    "Assembled data point"
                );
            }
            Err(err) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::info!(issue = number, kind = err.kind(), reason = %err, "Skipping issue");
            }
        }
        result
    }
}

async fn emit(tx: &Option<Sender<PipelineEvent>>, event: PipelineEvent) {
    if let Some(sender) = tx {
        let _ = sender.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builders_clamp() {
        let config = PipelineConfig::default()
            .with_concurrency(0)
            .with_start_page(0)
            .with_max_issues(Some(10));
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.start_page, 1);
        assert_eq!(config.max_issues, Some(10));
    }

    #[test]
    fn test_report_groups_skips_by_kind() {
        let mut report = PipelineReport::default();
        for (issue, kind) in [(1, "empty_tests"), (2, "ambiguous_link"), (3, "empty_tests")] {
            report.skipped.push(SkippedIssue {
                issue,
                kind: kind.to_string(),
                reason: String::new(),
            });
        }
        let counts = report.skipped_by_kind();
        assert_eq!(counts["empty_tests"], 2);
        assert_eq!(counts["ambiguous_link"], 1);
    }
}
