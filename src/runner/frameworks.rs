//! Test framework knowledge: how to select tests on the command line, how
//! to read per-test verdicts out of raw output, and how reported ids relate
//! to the ids recorded in a data point.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::result::{TestResult, TestStatus};
use crate::swe::input_validation::shell_quote;

/// Output format of a repository's test command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestFramework {
    #[default]
    Pytest,
    Cargo,
    Go,
}

impl std::fmt::Display for TestFramework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestFramework::Pytest => write!(f, "pytest"),
            TestFramework::Cargo => write!(f, "cargo"),
            TestFramework::Go => write!(f, "go"),
        }
    }
}

impl std::str::FromStr for TestFramework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pytest" | "python" => Ok(TestFramework::Pytest),
            "cargo" | "rust" => Ok(TestFramework::Cargo),
            "go" | "golang" => Ok(TestFramework::Go),
            other => Err(format!("unknown test framework: {}", other)),
        }
    }
}

impl TestFramework {
    /// Test command used when a repository profile does not set one.
    /// `{tests}` is replaced by [`selection_args`](Self::selection_args).
    pub fn default_command(&self) -> &'static str {
        match self {
            TestFramework::Pytest => "python -m pytest -rA -p no:cacheprovider {tests}",
            TestFramework::Cargo => "cargo test --no-fail-fast -- {tests}",
            TestFramework::Go => "go test -v ./... {tests}",
        }
    }

    /// Command-line fragment selecting `ids`; empty selects everything.
    pub fn selection_args(&self, ids: &[String]) -> String {
        if ids.is_empty() {
            return String::new();
        }
        match self {
            TestFramework::Pytest | TestFramework::Cargo => ids
                .iter()
                .map(|id| shell_quote(id))
                .collect::<Vec<_>>()
                .join(" "),
            TestFramework::Go => {
                let mut roots: Vec<&str> = ids
                    .iter()
                    .map(|id| id.split('/').next().unwrap_or(id))
                    .collect();
                roots.sort_unstable();
                roots.dedup();
                format!("-run {}", shell_quote(&format!("^({})$", roots.join("|"))))
            }
        }
    }

    /// Whether an id reported by the runner belongs to an expected id.
    ///
    /// pytest parameterisations (`test_x[1]`) and file-level collection
    /// errors roll up into the test id; cargo ids match on their final path
    /// segments; go subtests (`TestX/case`) roll up into `TestX`.
    pub fn matches(&self, expected: &str, observed: &str) -> bool {
        if expected == observed {
            return true;
        }
        match self {
            TestFramework::Pytest => {
                let base = observed.split('[').next().unwrap_or(observed);
                base == expected
                    || (!observed.contains("::")
                        && expected
                            .split("::")
                            .next()
                            .is_some_and(|file| file == observed))
            }
            TestFramework::Cargo => {
                observed.ends_with(&format!("::{}", expected))
                    || expected.ends_with(&format!("::{}", observed))
            }
            TestFramework::Go => observed.starts_with(&format!("{}/", expected)),
        }
    }

    /// Aggregate status of `expected` over every matching result, or `None`
    /// when nothing matched.
    pub fn verdict(&self, expected: &str, results: &[TestResult]) -> Option<TestStatus> {
        results
            .iter()
            .filter(|r| self.matches(expected, &r.id))
            .map(|r| r.status)
            .reduce(TestStatus::worst)
    }

    /// Extract per-test results from raw (possibly truncated) output.
    ///
    /// Lines that cannot be read are ignored. When the same id is reported
    /// more than once the last report wins, keeping first-seen order.
    pub fn parse_output(&self, output: &str) -> Vec<TestResult> {
        let mut collector = ResultCollector::default();
        for raw in output.lines() {
            let line = strip_ansi(raw);
            let parsed = match self {
                TestFramework::Pytest => parse_pytest_line(line.trim()),
                TestFramework::Cargo => parse_cargo_line(line.trim_end()),
                TestFramework::Go => parse_go_line(line.trim()),
            };
            if let Some((id, status)) = parsed {
                collector.record(id, status, line.trim());
            }
        }
        collector.finish()
    }
}

#[derive(Default)]
struct ResultCollector {
    results: Vec<TestResult>,
    index: HashMap<String, usize>,
}

impl ResultCollector {
    fn record(&mut self, id: &str, status: TestStatus, line: &str) {
        match self.index.get(id) {
            Some(&i) => {
                self.results[i].status = status;
                self.results[i].output = line.to_string();
            }
            None => {
                self.index.insert(id.to_string(), self.results.len());
                self.results.push(TestResult::new(id, status, line));
            }
        }
    }

    fn finish(self) -> Vec<TestResult> {
        self.results
    }
}

fn pytest_status(word: &str) -> Option<TestStatus> {
    match word {
        "PASSED" | "XPASS" => Some(TestStatus::Pass),
        "FAILED" => Some(TestStatus::Fail),
        "ERROR" => Some(TestStatus::Error),
        "SKIPPED" | "XFAIL" => Some(TestStatus::Skip),
        _ => None,
    }
}

fn looks_like_pytest_id(id: &str) -> bool {
    id.contains("::") || id.ends_with(".py")
}

/// `PASSED tests/a.py::t` (`-rA` summary) or `tests/a.py::t PASSED [ 50%]` (`-v`).
fn parse_pytest_line(line: &str) -> Option<(&str, TestStatus)> {
    let (first, rest) = line.split_once(' ')?;
    if let Some(status) = pytest_status(first) {
        let id = rest.split(" - ").next().unwrap_or(rest).trim();
        return looks_like_pytest_id(id).then_some((id, status));
    }
    let status = rest.split_whitespace().next().and_then(pytest_status)?;
    first.contains("::").then_some((first, status))
}

/// `test path::name ... ok|FAILED|ignored`. A name with no verdict means
/// the process died while that test was running.
fn parse_cargo_line(line: &str) -> Option<(&str, TestStatus)> {
    let rest = line.strip_prefix("test ")?;
    let (id, verdict) = rest.split_once(" ...")?;
    let verdict = verdict.trim();
    let status = if verdict == "ok" {
        TestStatus::Pass
    } else if verdict.starts_with("FAILED") {
        TestStatus::Fail
    } else if verdict.starts_with("ignored") {
        TestStatus::Skip
    } else if verdict.is_empty() {
        TestStatus::Error
    } else {
        return None;
    };
    Some((id.trim(), status))
}

/// `--- PASS: TestName (0.01s)`; subtests are indented.
fn parse_go_line(line: &str) -> Option<(&str, TestStatus)> {
    let rest = line.strip_prefix("--- ")?;
    let (word, rest) = rest.split_once(": ")?;
    let status = match word {
        "PASS" => TestStatus::Pass,
        "FAIL" => TestStatus::Fail,
        "SKIP" => TestStatus::Skip,
        _ => return None,
    };
    let id = rest.split_whitespace().next()?;
    Some((id, status))
}

/// Remove ANSI colour sequences (`ESC [ ... letter`).
fn strip_ansi(line: &str) -> std::borrow::Cow<'_, str> {
    if !line.contains('\x1b') {
        return std::borrow::Cow::Borrowed(line);
    }
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for n in chars.by_ref() {
                if n.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    std::borrow::Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pytest_summary_and_verbose_lines() {
        let output = "\
============================= test session starts ==============================
tests/test_foo.py::test_a PASSED                                         [ 33%]
tests/test_foo.py::test_b FAILED                                         [ 66%]
tests/test_foo.py::test_c[1] PASSED                                      [100%]
=========================== short test summary info ============================
PASSED tests/test_foo.py::test_a
FAILED tests/test_foo.py::test_b - assert 1 == 2
ERROR tests/test_bar.py - ImportError: cannot import name 'x'
";
        let results = TestFramework::Pytest.parse_output(output);
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "tests/test_foo.py::test_a",
                "tests/test_foo.py::test_b",
                "tests/test_foo.py::test_c[1]",
                "tests/test_bar.py",
            ]
        );
        assert_eq!(results[1].status, TestStatus::Fail);
        assert_eq!(results[3].status, TestStatus::Error);
    }

    #[test]
    fn test_pytest_partial_output_keeps_results_so_far() {
        let output = "tests/t.py::test_one PASSED [ 50%]\ntests/t.py::test_two ";
        let results = TestFramework::Pytest.parse_output(output);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "tests/t.py::test_one");
    }

    #[test]
    fn test_pytest_verdict_rolls_up_params_and_collection_errors() {
        let results = vec![
            TestResult::new("tests/t.py::test_x[1]", TestStatus::Pass, ""),
            TestResult::new("tests/t.py::test_x[2]", TestStatus::Fail, ""),
            TestResult::new("tests/broken.py", TestStatus::Error, ""),
        ];
        let fw = TestFramework::Pytest;
        assert_eq!(fw.verdict("tests/t.py::test_x", &results), Some(TestStatus::Fail));
        assert_eq!(
            fw.verdict("tests/broken.py::test_y", &results),
            Some(TestStatus::Error)
        );
        assert_eq!(fw.verdict("tests/t.py::test_missing", &results), None);
    }

    #[test]
    fn test_cargo_lines() {
        let output = "\
running 3 tests
test parser::tests::parses_empty ... ok
test parser::tests::rejects_garbage ... FAILED
test slow ... ignored, takes forever
test crashing::one ...
";
        let results = TestFramework::Cargo.parse_output(output);
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].status, TestStatus::Pass);
        assert_eq!(results[1].status, TestStatus::Fail);
        assert_eq!(results[2].status, TestStatus::Skip);
        assert_eq!(results[3].status, TestStatus::Error);
        assert!(TestFramework::Cargo.matches("parses_empty", "parser::tests::parses_empty"));
        assert!(!TestFramework::Cargo.matches("empty", "parser::tests::parses_empty"));
    }

    #[test]
    fn test_go_lines_and_subtests() {
        let output = "\
=== RUN   TestAdd
=== RUN   TestAdd/negative
    --- FAIL: TestAdd/negative (0.00s)
--- FAIL: TestAdd (0.00s)
--- PASS: TestSub (0.00s)
--- SKIP: TestNet (0.00s)
FAIL
";
        let results = TestFramework::Go.parse_output(output);
        assert_eq!(results.len(), 4);
        assert_eq!(
            TestFramework::Go.verdict("TestAdd", &results),
            Some(TestStatus::Fail)
        );
        assert_eq!(
            TestFramework::Go.verdict("TestSub", &results),
            Some(TestStatus::Pass)
        );
    }

    #[test]
    fn test_ansi_sequences_are_ignored() {
        let output = "\x1b[32mPASSED\x1b[0m tests/t.py::test_ok";
        let results = TestFramework::Pytest.parse_output(output);
        assert_eq!(results[0].id, "tests/t.py::test_ok");
        assert_eq!(results[0].status, TestStatus::Pass);
    }

    #[test]
    fn test_selection_args() {
        let ids = vec!["TestB/sub".to_string(), "TestA".to_string()];
        assert_eq!(TestFramework::Go.selection_args(&ids), "-run '^(TestA|TestB)$'");
        let ids = vec!["tests/t.py::test_x[a b]".to_string()];
        assert_eq!(
            TestFramework::Pytest.selection_args(&ids),
            "'tests/t.py::test_x[a b]'"
        );
        assert_eq!(TestFramework::Cargo.selection_args(&[]), "");
    }

    #[test]
    fn test_framework_from_str() {
        assert_eq!("golang".parse::<TestFramework>(), Ok(TestFramework::Go));
        assert!("mocha".parse::<TestFramework>().is_err());
    }
}
