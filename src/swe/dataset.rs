//! De-duplicating, incrementally extendable JSONL dataset.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::swe::CodingAgentDataPoint;

/// What happened to a record offered to the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Same issue, same content; nothing changed.
    Duplicate,
    /// Same issue, different digest; the existing record was kept.
    Conflicting,
}

/// Data points keyed by issue number, iterated in issue order.
#[derive(Debug, Clone, Default)]
pub struct DatasetAccumulator {
    records: BTreeMap<u64, CodingAgentDataPoint>,
}

impl DatasetAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an existing dataset. A missing file is an empty dataset.
    pub fn load_jsonl(path: &Path) -> Result<Self> {
        let mut dataset = Self::new();
        if !path.exists() {
            return Ok(dataset);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read dataset {}", path.display()))?;
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: CodingAgentDataPoint = serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid data point", path.display(), idx + 1))?;
            if !record.digest_matches() {
                tracing::warn!(
                    instance_id = %record.instance_id,
                    "Stored digest does not match patch content"
                );
            }
            if dataset.insert(record) != InsertOutcome::Inserted {
                tracing::warn!(
                    path = %path.display(),
                    line = idx + 1,
                    "Duplicate issue in dataset file, keeping the first record"
                );
            }
        }
        Ok(dataset)
    }

    pub fn contains(&self, issue: u64) -> bool {
        self.records.contains_key(&issue)
    }

    pub fn get(&self, issue: u64) -> Option<&CodingAgentDataPoint> {
        self.records.get(&issue)
    }

    pub fn insert(&mut self, record: CodingAgentDataPoint) -> InsertOutcome {
        match self.records.get(&record.issue_number) {
            None => {
                self.records.insert(record.issue_number, record);
                InsertOutcome::Inserted
            }
            Some(existing) if existing.digest == record.digest => InsertOutcome::Duplicate,
            Some(existing) => {
                tracing::warn!(
                    issue = record.issue_number,
                    existing = %existing.digest,
                    offered = %record.digest,
                    "Conflicting record for issue, keeping the existing one"
                );
                InsertOutcome::Conflicting
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records sorted by issue number.
    pub fn records(&self) -> impl Iterator<Item = &CodingAgentDataPoint> {
        self.records.values()
    }

    pub fn into_records(self) -> Vec<CodingAgentDataPoint> {
        self.records.into_values().collect()
    }

    pub fn to_jsonl(&self) -> Result<String> {
        let mut out = String::new();
        for record in self.records() {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Write the whole dataset, replacing `path` atomically.
    pub fn write_jsonl(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        tmp.write_all(self.to_jsonl()?.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path)
            .with_context(|| format!("failed to write dataset {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::frameworks::TestFramework;
    use chrono::Utc;

    fn record(issue: u64, patch: &str) -> CodingAgentDataPoint {
        let test_patch = "diff --git a/t.py b/t.py\n".to_string();
        CodingAgentDataPoint {
            instance_id: format!("o__r-{}", issue),
            repo: "o/r".to_string(),
            issue_number: issue,
            pull_number: issue + 100,
            base_commit: "a".repeat(40),
            merge_commit: "b".repeat(40),
            problem_statement: "p".to_string(),
            hints_text: String::new(),
            patch: patch.to_string(),
            digest: CodingAgentDataPoint::compute_digest(patch, &test_patch),
            test_patch,
            expected_pass: vec!["t.py::test_a".to_string()],
            test_framework: TestFramework::Pytest,
            test_command: None,
            created_at: Utc::now(),
            merged_at: None,
            version: None,
            environment_setup_commit: String::new(),
        }
    }

    #[test]
    fn test_insert_is_keyed_by_issue() {
        let mut ds = DatasetAccumulator::new();
        assert_eq!(ds.insert(record(2, "x")), InsertOutcome::Inserted);
        assert_eq!(ds.insert(record(1, "y")), InsertOutcome::Inserted);
        assert_eq!(ds.insert(record(2, "x")), InsertOutcome::Duplicate);
        assert_eq!(ds.insert(record(2, "z")), InsertOutcome::Conflicting);
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.get(2).unwrap().patch, "x");
        let order: Vec<u64> = ds.records().map(|r| r.issue_number).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_jsonl_round_trip_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("data.jsonl");

        let mut ds = DatasetAccumulator::new();
        ds.insert(record(3, "a"));
        ds.insert(record(1, "b"));
        ds.write_jsonl(&path).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first.lines().count(), 2);

        let mut loaded = DatasetAccumulator::load_jsonl(&path).unwrap();
        assert!(loaded.contains(1) && loaded.contains(3));
        assert_eq!(loaded.insert(record(3, "a")), InsertOutcome::Duplicate);
        loaded.write_jsonl(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
    }

    #[test]
    fn test_missing_file_is_empty_and_bad_line_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = DatasetAccumulator::load_jsonl(&dir.path().join("none.jsonl")).unwrap();
        assert!(missing.is_empty());

        let bad = dir.path().join("bad.jsonl");
        std::fs::write(&bad, "{\"not\": \"a record\"}\n").unwrap();
        let err = DatasetAccumulator::load_jsonl(&bad).unwrap_err();
        assert!(err.to_string().contains(":1:"));
    }
}
