//! Gold patch extraction: split a linked pull request's diff into the
//! production fix and the tests that verify it.

use crate::error::GoldPatchError;
use crate::swe::diff::{FileDiff, PatchSet};
use crate::swe::LinkedPullRequest;

/// A set of normalised directory prefixes.
///
/// Prefixes are stored with forward slashes, without a leading `a/`, `b/`
/// or `./`, and always with a trailing `/` so that `tests` never matches
/// `testsuite/x.py`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathPrefixSet {
    prefixes: Vec<String>,
}

impl PathPrefixSet {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut prefixes: Vec<String> = prefixes
            .into_iter()
            .filter_map(|p| normalize_prefix(p.as_ref()))
            .collect();
        prefixes.sort();
        prefixes.dedup();
        Self { prefixes }
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.prefixes
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }
}

fn strip_diff_prefixes(value: &str) -> String {
    let mut value = value.trim().replace('\\', "/");
    loop {
        let stripped = value
            .strip_prefix("./")
            .or_else(|| value.strip_prefix("a/"))
            .or_else(|| value.strip_prefix("b/"))
            .map(str::to_string);
        match stripped {
            Some(rest) => value = rest,
            None => break,
        }
    }
    value.trim_start_matches('/').to_string()
}

fn normalize_prefix(prefix: &str) -> Option<String> {
    let mut value = strip_diff_prefixes(prefix);
    if value.is_empty() {
        return None;
    }
    if !value.ends_with('/') {
        value.push('/');
    }
    Some(value)
}

fn normalize_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    path.trim_start_matches("./").to_string()
}

/// Filename conventions used when no test directories are configured.
fn looks_like_test_path(path: &str) -> bool {
    let lowered = path.to_lowercase();
    let file = lowered.rsplit('/').next().unwrap_or(&lowered);
    let in_test_dir = lowered
        .split('/')
        .rev()
        .skip(1)
        .any(|dir| matches!(dir, "test" | "tests" | "testing" | "__tests__" | "spec"));
    in_test_dir
        || (file.starts_with("test_") && file.ends_with(".py"))
        || file.ends_with("_test.py")
        || file.ends_with("_test.go")
        || file.ends_with("_test.rs")
        || file.ends_with(".test.js")
        || file.ends_with(".test.ts")
        || file.ends_with(".spec.js")
        || file.ends_with(".spec.ts")
}

/// Configuration for [`GoldPatchExtractor`].
#[derive(Debug, Clone)]
pub struct GoldPatchExtractorConfig {
    pub test_prefixes: PathPrefixSet,
    pub ignore_prefixes: PathPrefixSet,
}

impl Default for GoldPatchExtractorConfig {
    fn default() -> Self {
        Self {
            test_prefixes: PathPrefixSet::default(),
            ignore_prefixes: PathPrefixSet::new([".github"]),
        }
    }
}

impl GoldPatchExtractorConfig {
    pub fn with_test_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.test_prefixes = PathPrefixSet::new(prefixes);
        self
    }

    pub fn with_ignore_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ignore_prefixes = PathPrefixSet::new(prefixes);
        self
    }
}

/// The two disjoint halves of a pull request's diff.
#[derive(Debug, Clone, Default)]
pub struct GoldPatch {
    pub production: PatchSet,
    pub tests: PatchSet,
    /// Display paths of sections dropped by the ignore set.
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GoldPatchExtractor {
    config: GoldPatchExtractorConfig,
}

impl GoldPatchExtractor {
    pub fn new(config: GoldPatchExtractorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GoldPatchExtractorConfig {
        &self.config
    }

    /// Whether a file section belongs to the test partition. Any path the
    /// section touches counts, so renames into or out of a test directory
    /// and deletions of test files are tests.
    pub fn is_test_file(&self, file: &FileDiff) -> bool {
        let paths = file.paths();
        if self.config.test_prefixes.is_empty() {
            paths.iter().any(|p| looks_like_test_path(p))
        } else {
            paths.iter().any(|p| self.config.test_prefixes.matches(p))
        }
    }

    fn is_ignored(&self, file: &FileDiff) -> bool {
        file.paths()
            .iter()
            .any(|p| self.config.ignore_prefixes.matches(p))
    }

    /// Split a diff without judging the result.
    pub fn partition(&self, diff: &PatchSet) -> GoldPatch {
        let mut production = Vec::new();
        let mut tests = Vec::new();
        let mut dropped = Vec::new();
        for file in &diff.files {
            if self.is_test_file(file) {
                tests.push(file.clone());
            } else if self.is_ignored(file) {
                dropped.push(file.path().to_string());
            } else {
                production.push(file.clone());
            }
        }
        GoldPatch {
            production: PatchSet::from_files(production),
            tests: PatchSet::from_files(tests),
            dropped,
        }
    }

    /// Split the linked PR's diff, rejecting PRs that lack either half.
    pub fn extract(&self, linked: &LinkedPullRequest) -> Result<GoldPatch, GoldPatchError> {
        let gold = self.partition(&linked.diff);
        if !gold.dropped.is_empty() {
            tracing::debug!(
                pull = linked.number(),
                dropped = ?gold.dropped,
                "Dropped ignored paths from gold patch"
            );
        }
        if gold.production.is_empty() {
            return Err(GoldPatchError::EmptyProduction {
                pull: linked.number(),
            });
        }
        if gold.tests.is_empty() {
            return Err(GoldPatchError::EmptyTests {
                pull: linked.number(),
            });
        }
        Ok(gold)
    }
}
