//! Derive the expected-pass test identifiers of a data point from its test
//! patch: tests the patch adds, plus existing tests whose bodies it edits.

use std::collections::BTreeSet;

use crate::runner::frameworks::TestFramework;
use crate::swe::diff::{FileDiff, Hunk, LineKind, PatchSet};

/// Sorted, de-duplicated ids in the format `framework` reports them.
pub fn expected_test_ids(framework: TestFramework, tests: &PatchSet) -> Vec<String> {
    let mut ids = BTreeSet::new();
    for file in &tests.files {
        if file.is_deleted() || file.is_binary() {
            continue;
        }
        for hunk in &file.hunks {
            match framework {
                TestFramework::Pytest => scan_python(file, hunk, &mut ids),
                TestFramework::Cargo => scan_rust(hunk, &mut ids),
                TestFramework::Go => scan_go(hunk, &mut ids),
            }
        }
    }
    ids.into_iter().collect()
}

fn identifier(s: &str) -> &str {
    let end = s
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(s.len());
    &s[..end]
}

fn indent_of(text: &str) -> usize {
    text.len() - text.trim_start().len()
}

// ---------------------------------------------------------------------------
// Python
// ---------------------------------------------------------------------------

/// `def test_x(` / `async def test_x(` with its indentation.
fn python_test_def(text: &str) -> Option<(usize, &str)> {
    let trimmed = text.trim_start();
    let rest = trimmed.strip_prefix("async ").unwrap_or(trimmed).trim_start();
    let rest = rest.strip_prefix("def ")?.trim_start();
    let name = identifier(rest);
    (name.starts_with("test") && rest[name.len()..].trim_start().starts_with('('))
        .then_some((indent_of(text), name))
}

fn python_class(text: &str) -> Option<(usize, &str)> {
    let trimmed = text.trim_start();
    let name = identifier(trimmed.strip_prefix("class ")?.trim_start());
    (!name.is_empty()).then_some((indent_of(text), name))
}

fn scan_python(file: &FileDiff, hunk: &Hunk, ids: &mut BTreeSet<String>) {
    let path = file.path();
    let mut class: Option<(usize, String)> = None;
    let mut current: Option<String> = None;

    let section = hunk.section();
    if let Some((_, name)) = python_class(section) {
        class = Some((0, name.to_string()));
    } else if let Some((_, name)) = python_test_def(section) {
        current = Some(format!("{}::{}", path, name));
    }

    for line in &hunk.lines {
        if line.kind == LineKind::NoNewline {
            continue;
        }
        let text = line.text().trim_end_matches(['\n', '\r']);
        if line.kind != LineKind::Removed {
            if let Some((indent, name)) = python_class(text) {
                class = Some((indent, name.to_string()));
                current = None;
                continue;
            }
            if let Some((indent, name)) = python_test_def(text) {
                let id = match &class {
                    Some((class_indent, class_name))
                        if indent > *class_indent && class_name.starts_with("Test") =>
                    {
                        format!("{}::{}::{}", path, class_name, name)
                    }
                    _ => format!("{}::{}", path, name),
                };
                if line.kind == LineKind::Added {
                    ids.insert(id.clone());
                }
                current = Some(id);
                continue;
            }
            let starts_block = !text.trim().is_empty()
                && indent_of(text) == 0
                && !text.trim_start().starts_with(['@', '#', ')']);
            if starts_block {
                class = None;
                current = None;
            }
        }
        if matches!(line.kind, LineKind::Added | LineKind::Removed) && !text.trim().is_empty() {
            if let Some(id) = &current {
                ids.insert(id.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rust
// ---------------------------------------------------------------------------

fn is_test_attribute(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with("#[") && trimmed.contains("test")
}

fn rust_fn_name(text: &str) -> Option<&str> {
    let mut rest = text.trim_start();
    for qualifier in ["pub(crate) ", "pub ", "async ", "unsafe "] {
        rest = rest.strip_prefix(qualifier).unwrap_or(rest).trim_start();
    }
    let name = identifier(rest.strip_prefix("fn ")?.trim_start());
    (!name.is_empty()).then_some(name)
}

fn scan_rust(hunk: &Hunk, ids: &mut BTreeSet<String>) {
    let mut pending_attr = false;
    let mut attr_added = false;
    let mut current: Option<(usize, String)> = None;

    for line in &hunk.lines {
        if line.kind == LineKind::NoNewline {
            continue;
        }
        let text = line.text().trim_end_matches(['\n', '\r']);
        let mut closes = false;
        if line.kind != LineKind::Removed {
            if is_test_attribute(text) {
                pending_attr = true;
                attr_added |= line.kind == LineKind::Added;
                continue;
            }
            if let Some(name) = rust_fn_name(text) {
                if pending_attr {
                    if attr_added || line.kind == LineKind::Added {
                        ids.insert(name.to_string());
                    }
                    current = Some((indent_of(text), name.to_string()));
                } else {
                    current = None;
                }
                pending_attr = false;
                attr_added = false;
                continue;
            }
            let trimmed = text.trim_start();
            if !trimmed.is_empty() && !trimmed.starts_with("//") {
                pending_attr = false;
                attr_added = false;
            }
            closes = current
                .as_ref()
                .is_some_and(|(indent, _)| trimmed == "}" && indent_of(text) == *indent);
        }
        if matches!(line.kind, LineKind::Added | LineKind::Removed) && !text.trim().is_empty() {
            if let Some((_, name)) = &current {
                ids.insert(name.clone());
            }
        }
        if closes {
            current = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Go
// ---------------------------------------------------------------------------

fn go_test_func(text: &str) -> Option<&str> {
    let name = identifier(text.strip_prefix("func ")?);
    (name.starts_with("Test") && text["func ".len() + name.len()..].starts_with('('))
        .then_some(name)
}

fn scan_go(hunk: &Hunk, ids: &mut BTreeSet<String>) {
    let mut current = go_test_func(hunk.section()).map(str::to_string);
    for line in &hunk.lines {
        if line.kind == LineKind::NoNewline {
            continue;
        }
        let text = line.text().trim_end_matches(['\n', '\r']);
        let mut closes = false;
        if line.kind != LineKind::Removed {
            if let Some(name) = go_test_func(text) {
                if line.kind == LineKind::Added {
                    ids.insert(name.to_string());
                }
                current = Some(name.to_string());
                continue;
            }
            if text.starts_with("func ") {
                current = None;
                continue;
            }
            closes = text == "}";
        }
        if matches!(line.kind, LineKind::Added | LineKind::Removed) && !text.trim().is_empty() {
            if let Some(name) = &current {
                ids.insert(name.clone());
            }
        }
        if closes {
            current = None;
        }
    }
}
