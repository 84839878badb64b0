//! GitHub REST v3 client for the mining pipeline.
//!
//! [`IssueTracker`] is the seam the linker, assembler and pipeline depend
//! on; [`GithubClient`] is the production implementation. Every request is
//! classified into a [`FetchError`] and retried through the shared
//! [`RetryPolicy`].

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::FetchError;
use crate::swe::{
    validate_git_ref, CommitInfo, Issue, IssueComment, PullRequestSummary, Release, RepoRef,
    ReviewComment, TimelineReference,
};
use crate::utils::{truncate, RetryPolicy};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const PER_PAGE: usize = 100;
/// GitHub caps `/pulls/{n}/commits` at 250 entries.
const MAX_COMMIT_PAGES: u32 = 3;

// ---------------------------------------------------------------------------
// Tracker seam
// ---------------------------------------------------------------------------

/// Which issues to walk and where to start.
#[derive(Debug, Clone)]
pub struct IssueQuery {
    pub state: String,
    /// 1-based page to start from; use the last page of a previous run to
    /// resume.
    pub start_page: u32,
    /// Stop after this many issues.
    pub max_issues: Option<usize>,
}

impl Default for IssueQuery {
    fn default() -> Self {
        Self {
            state: "closed".to_string(),
            start_page: 1,
            max_issues: None,
        }
    }
}

impl IssueQuery {
    pub fn with_start_page(mut self, page: u32) -> Self {
        self.start_page = page.max(1);
        self
    }

    pub fn with_max_issues(mut self, max: usize) -> Self {
        self.max_issues = Some(max);
        self
    }
}

/// One page of issues with pull request entries already removed.
#[derive(Debug, Clone, Default)]
pub struct IssuePage {
    pub issues: Vec<Issue>,
    pub has_more: bool,
}

/// One page of closed pull requests.
#[derive(Debug, Clone, Default)]
pub struct PullRequestPage {
    pub pulls: Vec<PullRequestSummary>,
    pub has_more: bool,
}

/// Read access to an issue tracker and its pull request history.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    fn repo(&self) -> &RepoRef;

    async fn list_issues(&self, query: &IssueQuery, page: u32) -> Result<IssuePage, FetchError>;

    async fn issue_comments(&self, issue: u64) -> Result<Vec<IssueComment>, FetchError>;

    async fn issue_timeline(&self, issue: u64) -> Result<Vec<TimelineReference>, FetchError>;

    /// Closed pull requests, newest first, without commit messages.
    async fn list_pull_requests(&self, page: u32) -> Result<PullRequestPage, FetchError>;

    /// Full pull request including its commit messages.
    async fn pull_request(&self, number: u64) -> Result<PullRequestSummary, FetchError>;

    async fn pull_request_diff(&self, number: u64) -> Result<String, FetchError>;

    async fn review_comments(&self, number: u64) -> Result<Vec<ReviewComment>, FetchError>;

    async fn commit(&self, sha: &str) -> Result<CommitInfo, FetchError>;

    /// Releases, newest first. Trackers without release data have none.
    async fn releases(&self) -> Result<Vec<Release>, FetchError> {
        Ok(Vec::new())
    }
}

/// Lazily walk issues page by page.
///
/// Items carry the page they came from so a caller can resume from that
/// page later. The stream ends at the last page, at `max_issues`, or after
/// the first error.
pub fn issue_stream<'a, T>(
    tracker: &'a T,
    query: IssueQuery,
) -> impl Stream<Item = Result<(u32, Issue), FetchError>> + 'a
where
    T: IssueTracker + ?Sized,
{
    async_stream::try_stream! {
        let mut page = query.start_page.max(1);
        let mut yielded = 0usize;
        'pages: loop {
            if query.max_issues.is_some_and(|max| yielded >= max) {
                break;
            }
            let batch = tracker.list_issues(&query, page).await?;
            for issue in batch.issues {
                if query.max_issues.is_some_and(|max| yielded >= max) {
                    break 'pages;
                }
                yielded += 1;
                yield (page, issue);
            }
            if !batch.has_more {
                break;
            }
            page += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GithubClientConfig {
    pub api_base: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for GithubClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            token: None,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default().with_max_delay(Duration::from_secs(900)),
        }
    }
}

impl GithubClientConfig {
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RawUser {
    login: String,
}

#[derive(Deserialize)]
struct RawLabel {
    name: String,
}

#[derive(Deserialize)]
struct RawIssue {
    number: u64,
    title: String,
    body: Option<String>,
    state: String,
    #[serde(default)]
    labels: Vec<RawLabel>,
    user: Option<RawUser>,
    #[serde(default)]
    html_url: String,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    pull_request: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawComment {
    user: Option<RawUser>,
    body: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawTimelineEvent {
    event: Option<String>,
    commit_id: Option<String>,
    source: Option<RawTimelineSource>,
}

#[derive(Deserialize)]
struct RawTimelineSource {
    issue: Option<RawSourceIssue>,
}

#[derive(Deserialize)]
struct RawSourceIssue {
    number: u64,
    pull_request: Option<serde_json::Value>,
    repository: Option<RawRepository>,
}

#[derive(Deserialize)]
struct RawRepository {
    full_name: String,
}

#[derive(Deserialize)]
struct RawGitRef {
    sha: String,
}

#[derive(Deserialize)]
struct RawPull {
    number: u64,
    title: String,
    body: Option<String>,
    state: String,
    merged: Option<bool>,
    merged_at: Option<DateTime<Utc>>,
    merge_commit_sha: Option<String>,
    base: RawGitRef,
    head: RawGitRef,
    created_at: DateTime<Utc>,
}

impl RawPull {
    fn into_summary(self, commit_messages: Vec<String>) -> PullRequestSummary {
        PullRequestSummary {
            number: self.number,
            title: self.title,
            body: self.body.unwrap_or_default(),
            state: self.state,
            merged: self.merged.unwrap_or(self.merged_at.is_some()),
            merged_at: self.merged_at,
            merge_commit_sha: self.merge_commit_sha,
            base_sha: self.base.sha,
            head_sha: self.head.sha,
            created_at: self.created_at,
            commit_messages,
        }
    }
}

#[derive(Deserialize)]
struct RawPullCommit {
    commit: RawCommitMessage,
}

#[derive(Deserialize)]
struct RawCommitMessage {
    message: String,
}

#[derive(Deserialize)]
struct RawSignature {
    date: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawCommitMeta {
    committer: Option<RawSignature>,
    author: Option<RawSignature>,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct RawCommit {
    sha: String,
    parents: Vec<RawGitRef>,
    commit: RawCommitMeta,
}

#[derive(Deserialize)]
struct RawRelease {
    tag_name: String,
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
}

#[derive(Deserialize)]
struct RawReviewComment {
    user: Option<RawUser>,
    body: Option<String>,
    #[serde(default)]
    path: String,
    #[serde(default)]
    diff_hunk: String,
}

fn login(user: Option<RawUser>) -> String {
    user.map(|u| u.login).unwrap_or_else(|| "ghost".to_string())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct GithubClient {
    http: reqwest::Client,
    api_base: String,
    repo: RepoRef,
    retry: RetryPolicy,
}

impl GithubClient {
    pub fn new(repo: RepoRef, config: GithubClientConfig) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("swe-harvest"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            reqwest::header::HeaderValue::from_static("2022-11-28"),
        );
        match &config.token {
            Some(token) => {
                let auth = format!("Bearer {}", token.trim());
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    reqwest::header::HeaderValue::from_str(&auth)
                        .context("invalid github authorization header")?,
                );
            }
            None => {
                tracing::warn!("No GitHub token configured; unauthenticated rate limits apply");
            }
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .context("failed to create github api client")?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            repo,
            retry: config.retry,
        })
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_base, self.repo.owner, self.repo.name, path
        )
    }

    /// One request, classified. Retrying is the caller's business.
    async fn send(
        &self,
        operation: &str,
        url: &str,
        accept: Option<&'static str>,
    ) -> Result<reqwest::Response, FetchError> {
        let mut request = self.http.get(url);
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }
        let response = request
            .send()
            .await
            .map_err(|e| classify_transport_error(operation, &e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = retry_after_hint(response.headers());
        let rate_limited = status.as_u16() == 403
            && response
                .headers()
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                == Some("0");
        let body = response.text().await.unwrap_or_default();
        let message = format!("HTTP {}: {}", status.as_u16(), truncate(&body, 500));

        if rate_limited || status.as_u16() == 429 || status.is_server_error() {
            Err(FetchError::Transient {
                operation: operation.to_string(),
                message,
                retry_after,
            })
        } else {
            Err(FetchError::fatal(operation, message))
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, operation: &str, url: &str) -> Result<T, FetchError> {
        self.retry
            .run(operation, move || async move {
                let response = self.send(operation, url, None).await?;
                response
                    .json::<T>()
                    .await
                    .map_err(|e| FetchError::fatal(operation, format!("failed to decode: {}", e)))
            })
            .await
    }

    async fn get_text(&self, operation: &str, url: &str, accept: &'static str) -> Result<String, FetchError> {
        self.retry
            .run(operation, move || async move {
                let response = self.send(operation, url, Some(accept)).await?;
                response
                    .text()
                    .await
                    .map_err(|e| classify_transport_error(operation, &e))
            })
            .await
    }

    /// Collect every page of a list endpoint, up to `max_pages`.
    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        max_pages: u32,
    ) -> Result<Vec<T>, FetchError> {
        let mut rows = Vec::new();
        for page in 1..=max_pages.max(1) {
            let url = format!(
                "{}?per_page={}&page={}",
                self.repo_url(path),
                PER_PAGE,
                page
            );
            let chunk: Vec<T> = self.get_json(operation, &url).await?;
            let chunk_len = chunk.len();
            rows.extend(chunk);
            if chunk_len < PER_PAGE {
                break;
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl IssueTracker for GithubClient {
    fn repo(&self) -> &RepoRef {
        &self.repo
    }

    async fn list_issues(&self, query: &IssueQuery, page: u32) -> Result<IssuePage, FetchError> {
        let url = format!(
            "{}?state={}&sort=created&direction=desc&per_page={}&page={}",
            self.repo_url("issues"),
            query.state,
            PER_PAGE,
            page
        );
        let raw: Vec<RawIssue> = self.get_json("list issues", &url).await?;
        let has_more = raw.len() >= PER_PAGE;
        let issues = raw
            .into_iter()
            .filter(|issue| issue.pull_request.is_none())
            .map(|issue| Issue {
                number: issue.number,
                title: issue.title,
                body: issue.body.unwrap_or_default(),
                state: issue.state,
                labels: issue.labels.into_iter().map(|l| l.name).collect(),
                author: login(issue.user),
                html_url: issue.html_url,
                created_at: issue.created_at,
                closed_at: issue.closed_at,
                comments: Vec::new(),
            })
            .collect();
        Ok(IssuePage { issues, has_more })
    }

    async fn issue_comments(&self, issue: u64) -> Result<Vec<IssueComment>, FetchError> {
        let raw: Vec<RawComment> = self
            .get_all_pages("list issue comments", &format!("issues/{}/comments", issue), 10)
            .await?;
        Ok(raw
            .into_iter()
            .map(|c| IssueComment {
                author: login(c.user),
                body: c.body.unwrap_or_default(),
                created_at: c.created_at,
            })
            .collect())
    }

    async fn issue_timeline(&self, issue: u64) -> Result<Vec<TimelineReference>, FetchError> {
        let raw: Vec<RawTimelineEvent> = self
            .get_all_pages("issue timeline", &format!("issues/{}/timeline", issue), 10)
            .await?;
        let own_repo = self.repo.full_name();
        Ok(raw
            .into_iter()
            .filter_map(|event| match event.event.as_deref() {
                Some("cross-referenced") => {
                    let source = event.source?.issue?;
                    source.pull_request.as_ref()?;
                    Some(TimelineReference::CrossReferenced {
                        repo: source
                            .repository
                            .map(|r| r.full_name)
                            .unwrap_or_else(|| own_repo.clone()),
                        pull: source.number,
                    })
                }
                Some("closed") => event
                    .commit_id
                    .map(|commit| TimelineReference::Closed { commit }),
                Some("referenced") => event
                    .commit_id
                    .map(|commit| TimelineReference::Referenced { commit }),
                _ => None,
            })
            .collect())
    }

    async fn list_pull_requests(&self, page: u32) -> Result<PullRequestPage, FetchError> {
        let url = format!(
            "{}?state=closed&sort=created&direction=desc&per_page={}&page={}",
            self.repo_url("pulls"),
            PER_PAGE,
            page
        );
        let raw: Vec<RawPull> = self.get_json("list pull requests", &url).await?;
        let has_more = raw.len() >= PER_PAGE;
        Ok(PullRequestPage {
            pulls: raw.into_iter().map(|p| p.into_summary(Vec::new())).collect(),
            has_more,
        })
    }

    async fn pull_request(&self, number: u64) -> Result<PullRequestSummary, FetchError> {
        let raw: RawPull = self
            .get_json("get pull request", &self.repo_url(&format!("pulls/{}", number)))
            .await?;
        let commits: Vec<RawPullCommit> = self
            .get_all_pages(
                "list pull request commits",
                &format!("pulls/{}/commits", number),
                MAX_COMMIT_PAGES,
            )
            .await?;
        Ok(raw.into_summary(commits.into_iter().map(|c| c.commit.message).collect()))
    }

    async fn pull_request_diff(&self, number: u64) -> Result<String, FetchError> {
        self.get_text(
            "get pull request diff",
            &self.repo_url(&format!("pulls/{}", number)),
            "application/vnd.github.v3.diff",
        )
        .await
    }

    async fn review_comments(&self, number: u64) -> Result<Vec<ReviewComment>, FetchError> {
        let raw: Vec<RawReviewComment> = self
            .get_all_pages("list review comments", &format!("pulls/{}/comments", number), 10)
            .await?;
        Ok(raw
            .into_iter()
            .map(|c| ReviewComment {
                author: login(c.user),
                body: c.body.unwrap_or_default(),
                path: c.path,
                diff_hunk: c.diff_hunk,
            })
            .collect())
    }

    async fn commit(&self, sha: &str) -> Result<CommitInfo, FetchError> {
        validate_git_ref(sha).map_err(|e| FetchError::fatal("get commit", e.to_string()))?;
        let raw: RawCommit = self
            .get_json("get commit", &self.repo_url(&format!("commits/{}", sha)))
            .await?;
        let committed_at = raw
            .commit
            .committer
            .or(raw.commit.author)
            .map(|s| s.date)
            .ok_or_else(|| FetchError::fatal("get commit", format!("commit {} has no date", sha)))?;
        Ok(CommitInfo {
            sha: raw.sha,
            parents: raw.parents.into_iter().map(|p| p.sha).collect(),
            committed_at,
            message: raw.commit.message,
        })
    }

    async fn releases(&self) -> Result<Vec<Release>, FetchError> {
        let raw: Vec<RawRelease> = self.get_all_pages("list releases", "releases", 10).await?;
        Ok(raw
            .into_iter()
            .map(|r| Release {
                tag_name: r.tag_name,
                published_at: r.published_at,
                draft: r.draft,
                prerelease: r.prerelease,
            })
            .collect())
    }
}

fn classify_transport_error(operation: &str, error: &reqwest::Error) -> FetchError {
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        FetchError::transient(operation, error.to_string())
    } else {
        FetchError::fatal(operation, error.to_string())
    }
}

/// `retry-after` seconds, else time until `x-ratelimit-reset`.
fn retry_after_hint(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };
    if let Some(seconds) = header("retry-after") {
        return Some(Duration::from_secs(seconds.max(0) as u64));
    }
    let reset = header("x-ratelimit-reset")?;
    let wait = reset - Utc::now().timestamp();
    Some(Duration::from_secs(wait.max(1) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::Mutex;

    fn issue(number: u64) -> Issue {
        Issue {
            number,
            title: format!("Issue {}", number),
            body: String::new(),
            state: "closed".to_string(),
            labels: vec![],
            author: "a".to_string(),
            html_url: String::new(),
            created_at: Utc::now(),
            closed_at: None,
            comments: vec![],
        }
    }

    /// Serves fixed pages of issues; every other method is unused.
    struct PagedTracker {
        repo: RepoRef,
        pages: Vec<Result<Vec<u64>, FetchError>>,
        requested: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl IssueTracker for PagedTracker {
        fn repo(&self) -> &RepoRef {
            &self.repo
        }

        async fn list_issues(&self, _query: &IssueQuery, page: u32) -> Result<IssuePage, FetchError> {
            self.requested.lock().unwrap().push(page);
            let idx = (page - 1) as usize;
            match self.pages.get(idx) {
                Some(Ok(numbers)) => Ok(IssuePage {
                    issues: numbers.iter().map(|n| issue(*n)).collect(),
                    has_more: idx + 1 < self.pages.len(),
                }),
                Some(Err(e)) => Err(e.clone()),
                None => Ok(IssuePage::default()),
            }
        }

        async fn issue_comments(&self, _: u64) -> Result<Vec<IssueComment>, FetchError> {
            Ok(vec![])
        }

        async fn issue_timeline(&self, _: u64) -> Result<Vec<TimelineReference>, FetchError> {
            Ok(vec![])
        }

        async fn list_pull_requests(&self, _: u32) -> Result<PullRequestPage, FetchError> {
            Ok(PullRequestPage::default())
        }

        async fn pull_request(&self, n: u64) -> Result<PullRequestSummary, FetchError> {
            Err(FetchError::fatal("get pull request", format!("no #{}", n)))
        }

        async fn pull_request_diff(&self, n: u64) -> Result<String, FetchError> {
            Err(FetchError::fatal("get pull request diff", format!("no #{}", n)))
        }

        async fn review_comments(&self, _: u64) -> Result<Vec<ReviewComment>, FetchError> {
            Ok(vec![])
        }

        async fn commit(&self, sha: &str) -> Result<CommitInfo, FetchError> {
            Err(FetchError::fatal("get commit", sha.to_string()))
        }
    }

    fn tracker(pages: Vec<Result<Vec<u64>, FetchError>>) -> PagedTracker {
        PagedTracker {
            repo: RepoRef::parse("o/r").unwrap(),
            pages,
            requested: Mutex::new(vec![]),
        }
    }

    #[tokio::test]
    async fn test_stream_walks_pages_lazily() {
        let t = tracker(vec![Ok(vec![5, 4]), Ok(vec![3]), Ok(vec![2, 1])]);
        let items: Vec<_> = issue_stream(&t, IssueQuery::default().with_max_issues(3))
            .collect()
            .await;
        let numbers: Vec<(u32, u64)> = items
            .into_iter()
            .map(|r| r.map(|(p, i)| (p, i.number)).unwrap())
            .collect();
        assert_eq!(numbers, vec![(1, 5), (1, 4), (2, 3)]);
        assert_eq!(*t.requested.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_stream_resumes_from_page() {
        let t = tracker(vec![Ok(vec![5, 4]), Ok(vec![3]), Ok(vec![2, 1])]);
        let items: Vec<_> = issue_stream(&t, IssueQuery::default().with_start_page(3))
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert_eq!(*t.requested.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_stream_ends_after_error() {
        let t = tracker(vec![
            Ok(vec![2]),
            Err(FetchError::fatal("list issues", "HTTP 401")),
            Ok(vec![1]),
        ]);
        let items: Vec<_> = issue_stream(&t, IssueQuery::default()).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(FetchError::Fatal { .. })));
    }

    #[test]
    fn test_retry_after_hint_prefers_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", "7".parse().unwrap());
        assert_eq!(retry_after_hint(&headers), Some(Duration::from_secs(7)));

        let mut headers = reqwest::header::HeaderMap::new();
        let reset = Utc::now().timestamp() + 120;
        headers.insert("x-ratelimit-reset", reset.to_string().parse().unwrap());
        let hint = retry_after_hint(&headers).unwrap();
        assert!(hint <= Duration::from_secs(120) && hint >= Duration::from_secs(100));

        assert_eq!(retry_after_hint(&reqwest::header::HeaderMap::new()), None);
    }

    #[test]
    fn test_raw_timeline_parsing_shape() {
        let json = r#"[
            {"event": "cross-referenced", "source": {"type": "issue", "issue": {"number": 99, "pull_request": {"url": "x"}, "repository": {"full_name": "o/r"}}}},
            {"event": "cross-referenced", "source": {"type": "issue", "issue": {"number": 12}}},
            {"event": "closed", "commit_id": "abc123"},
            {"event": "labeled"}
        ]"#;
        let raw: Vec<RawTimelineEvent> = serde_json::from_str(json).unwrap();
        assert_eq!(raw.len(), 4);
        assert!(raw[0].source.as_ref().unwrap().issue.as_ref().unwrap().pull_request.is_some());
        assert!(raw[1].source.as_ref().unwrap().issue.as_ref().unwrap().pull_request.is_none());
        assert_eq!(raw[2].commit_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_raw_release_and_commit_parsing_shape() {
        let json = r#"[
            {"tag_name": "v1.2.0", "published_at": "2024-03-01T12:00:00Z", "draft": false, "prerelease": false},
            {"tag_name": "v1.3.0", "published_at": null, "draft": true}
        ]"#;
        let raw: Vec<RawRelease> = serde_json::from_str(json).unwrap();
        assert_eq!(raw[0].tag_name, "v1.2.0");
        assert!(raw[0].published_at.is_some());
        assert!(raw[1].draft && !raw[1].prerelease);

        let json = r#"{"sha": "abc", "parents": [{"sha": "def"}],
            "commit": {"message": "Fix x", "committer": {"date": "2024-03-02T00:00:00Z"}}}"#;
        let raw: RawCommit = serde_json::from_str(json).unwrap();
        assert_eq!(raw.commit.message, "Fix x");
    }

    #[tokio::test]
    #[ignore = "requires network access to api.github.com"]
    async fn test_live_issue_page() {
        let client = GithubClient::new(
            RepoRef::parse("rust-lang/rustlings").unwrap(),
            GithubClientConfig::default().with_token(std::env::var("GITHUB_TOKEN").ok()),
        )
        .unwrap();
        let page = client.list_issues(&IssueQuery::default(), 1).await.unwrap();
        assert!(page.issues.iter().all(|i| i.state == "closed"));
    }
}
