//! Applying unified diffs to a working tree.
//!
//! Application is all-or-nothing: every file section is applied to an
//! in-memory overlay first and nothing touches the disk until the whole
//! patch has been located. Hunks may land at an offset from their declared
//! position (nearest match wins, forward on ties) but context must match
//! exactly.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PatchConflictError, PatchError};
use crate::execution::ExecutionEnvironment;
use crate::swe::diff::{FileDiff, Hunk, PatchSet};
use crate::swe::input_validation::validate_relative_path;

const SYMLINK_MODE: &str = "120000";
const EXECUTABLE_MODE: &str = "100755";

/// What happened to one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum FileChange {
    Created,
    Modified,
    Deleted,
    Renamed { from: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedFile {
    pub path: String,
    #[serde(flatten)]
    pub change: FileChange,
}

/// Summary of a successful application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub files: Vec<AppliedFile>,
    /// Hunks that matched away from their declared line.
    pub offset_hunks: usize,
}

impl ApplyResult {
    pub fn paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }
}

/// Staged content of a path. `None` in the overlay means deleted.
#[derive(Debug, Clone)]
struct FileState {
    lines: Vec<String>,
    executable: Option<bool>,
}

/// Applies [`PatchSet`]s to working trees.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatchApplicator;

impl PatchApplicator {
    pub fn new() -> Self {
        Self
    }

    /// Apply `patch` to the working tree of `env`.
    pub async fn apply(
        &self,
        env: &ExecutionEnvironment,
        patch: &PatchSet,
    ) -> Result<ApplyResult, PatchError> {
        let root = env.workdir().to_path_buf();
        let patch = patch.clone();
        let applicator = *self;
        let result = tokio::task::spawn_blocking(move || applicator.apply_to_tree(&root, &patch))
            .await
            .map_err(|e| PatchError::Io(std::io::Error::other(e.to_string())))??;
        tracing::debug!(
            environment = %env.id(),
            files = result.files.len(),
            offset_hunks = result.offset_hunks,
            "Patch applied"
        );
        Ok(result)
    }

    /// Parse `text` and apply it to the working tree of `env`.
    pub async fn apply_text(
        &self,
        env: &ExecutionEnvironment,
        text: &str,
    ) -> Result<ApplyResult, PatchError> {
        let patch = PatchSet::parse(text)?;
        self.apply(env, &patch).await
    }

    /// Apply `patch` to the directory tree at `root`.
    pub fn apply_to_tree(&self, root: &Path, patch: &PatchSet) -> Result<ApplyResult, PatchError> {
        let mut overlay = Overlay::new(root)?;
        let mut result = ApplyResult::default();

        for file in &patch.files {
            let applied = overlay.stage(file, &mut result.offset_hunks)?;
            result.files.push(applied);
        }

        overlay.commit()?;
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

struct Overlay {
    root: PathBuf,
    canonical_root: PathBuf,
    staged: HashMap<String, Option<FileState>>,
    order: Vec<String>,
}

impl Overlay {
    fn new(root: &Path) -> Result<Self, PatchError> {
        Ok(Self {
            root: root.to_path_buf(),
            canonical_root: root.canonicalize()?,
            staged: HashMap::new(),
            order: Vec::new(),
        })
    }

    fn stage(&mut self, file: &FileDiff, offset_hunks: &mut usize) -> Result<AppliedFile, PatchError> {
        for path in file.paths() {
            self.check_path(path)?;
        }
        let display = file.path().to_string();
        if file.is_binary() {
            return Err(PatchError::Unsupported {
                path: display,
                reason: "binary patches are not supported".to_string(),
            });
        }
        if file.new_mode() == Some(SYMLINK_MODE) {
            return Err(PatchError::Unsupported {
                path: display,
                reason: "symbolic links are not supported".to_string(),
            });
        }

        let source = match file.old_path() {
            None => {
                if self.exists(&display)? {
                    return Err(file_conflict(&display, "already exists"));
                }
                FileState {
                    lines: Vec::new(),
                    executable: None,
                }
            }
            Some(old) => self
                .load(old)?
                .ok_or_else(|| file_conflict(old, "does not exist in the working tree"))?,
        };

        let lines = apply_hunks(&display, source.lines, &file.hunks, offset_hunks)?;
        let executable = file
            .new_mode()
            .map(|mode| mode == EXECUTABLE_MODE)
            .or(source.executable);

        let change = match (file.old_path(), file.new_path()) {
            (Some(old), None) => {
                if !lines.is_empty() {
                    return Err(file_conflict(old, "deleted file still has content after the patch"));
                }
                self.put(old, None);
                FileChange::Deleted
            }
            (None, Some(new)) => {
                self.put(new, Some(FileState { lines, executable }));
                FileChange::Created
            }
            (Some(old), Some(new)) if old != new => {
                if self.exists(new)? {
                    return Err(file_conflict(new, "rename target already exists"));
                }
                self.put(old, None);
                self.put(new, Some(FileState { lines, executable }));
                FileChange::Renamed {
                    from: old.to_string(),
                }
            }
            (Some(_), Some(new)) => {
                self.put(new, Some(FileState { lines, executable }));
                FileChange::Modified
            }
            (None, None) => {
                return Err(PatchError::Unsupported {
                    path: display,
                    reason: "file section names no path".to_string(),
                })
            }
        };

        Ok(AppliedFile {
            path: display,
            change,
        })
    }

    fn check_path(&self, path: &str) -> Result<(), PatchError> {
        validate_relative_path(path).map_err(|e| PatchError::UnsafePath(e.to_string()))?;
        if Path::new(path)
            .components()
            .any(|c| matches!(c, Component::Normal(name) if name == ".git"))
        {
            return Err(PatchError::UnsafePath(format!(
                "'{}' points into the git directory",
                path
            )));
        }
        // A symlinked directory inside the tree could still lead outside it.
        let mut ancestor = self.root.join(path);
        while let Some(parent) = ancestor.parent() {
            ancestor = parent.to_path_buf();
            if ancestor.exists() {
                let real = ancestor.canonicalize()?;
                if !real.starts_with(&self.canonical_root) {
                    return Err(PatchError::UnsafePath(format!(
                        "'{}' resolves outside the working tree",
                        path
                    )));
                }
                break;
            }
        }
        Ok(())
    }

    fn put(&mut self, path: &str, state: Option<FileState>) {
        if !self.staged.contains_key(path) {
            self.order.push(path.to_string());
        }
        self.staged.insert(path.to_string(), state);
    }

    fn exists(&self, path: &str) -> Result<bool, PatchError> {
        match self.staged.get(path) {
            Some(state) => Ok(state.is_some()),
            None => Ok(self.root.join(path).symlink_metadata().is_ok()),
        }
    }

    fn load(&self, path: &str) -> Result<Option<FileState>, PatchError> {
        if let Some(state) = self.staged.get(path) {
            return Ok(state.clone());
        }
        let full = self.root.join(path);
        let meta = match full.symlink_metadata() {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !meta.file_type().is_file() {
            return Err(PatchError::Unsupported {
                path: path.to_string(),
                reason: "not a regular file".to_string(),
            });
        }
        let bytes = std::fs::read(&full)?;
        let text = String::from_utf8(bytes).map_err(|_| PatchError::Unsupported {
            path: path.to_string(),
            reason: "file is not valid UTF-8".to_string(),
        })?;
        Ok(Some(FileState {
            lines: text.split_inclusive('\n').map(str::to_string).collect(),
            executable: is_executable(&meta).then_some(true),
        }))
    }

    /// Write the overlay to disk: removals first so a rename onto a path
    /// freed in the same patch succeeds.
    fn commit(self) -> Result<(), PatchError> {
        for path in &self.order {
            if let Some(None) = self.staged.get(path) {
                match std::fs::remove_file(self.root.join(path)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        for path in &self.order {
            if let Some(Some(state)) = self.staged.get(path) {
                let full = self.root.join(path);
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&full, state.lines.concat())?;
                if let Some(executable) = state.executable {
                    set_executable(&full, executable)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> std::io::Result<()> {
    Ok(())
}

/// Executable bit of a file on disk, carried over to rename targets that
/// declare no mode of their own.
#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}

fn file_conflict(path: &str, reason: &str) -> PatchError {
    PatchError::Conflict(PatchConflictError {
        path: path.to_string(),
        hunk_index: None,
        header: None,
        reason: reason.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Hunk placement
// ---------------------------------------------------------------------------

fn apply_hunks(
    path: &str,
    lines: Vec<String>,
    hunks: &[Hunk],
    offset_hunks: &mut usize,
) -> Result<Vec<String>, PatchConflictError> {
    let mut out = Vec::with_capacity(lines.len());
    let mut cursor = 0usize;
    let mut offset = 0isize;

    for (index, hunk) in hunks.iter().enumerate() {
        let old = hunk.old_lines();
        let declared = if hunk.old_len == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let expected = (declared as isize + offset).max(0) as usize;

        let position = if old.is_empty() {
            Some(expected.clamp(cursor, lines.len()))
        } else {
            locate(&lines, &old, cursor, expected)
        };
        let Some(position) = position else {
            return Err(PatchConflictError {
                path: path.to_string(),
                hunk_index: Some(index + 1),
                header: Some(hunk.header().trim_end().to_string()),
                reason: "context does not match".to_string(),
            });
        };

        if position != expected {
            *offset_hunks += 1;
            tracing::debug!(
                path = %path,
                hunk = index + 1,
                shift = position as isize - expected as isize,
                "Hunk applied at offset"
            );
        }
        out.extend_from_slice(&lines[cursor..position]);
        out.extend(hunk.new_lines());
        cursor = position + old.len();
        offset = position as isize - declared as isize;
    }

    out.extend_from_slice(&lines[cursor..]);
    Ok(out)
}

/// Nearest index at or after `cursor` where `needle` occurs, searching
/// outwards from `expected`.
fn locate(lines: &[String], needle: &[String], cursor: usize, expected: usize) -> Option<usize> {
    if needle.len() > lines.len().saturating_sub(cursor) {
        return None;
    }
    let last = lines.len() - needle.len();
    let expected = expected.clamp(cursor, last);
    let matches_at = |start: usize| lines[start..start + needle.len()] == *needle;

    let mut distance = 0usize;
    loop {
        let forward = expected + distance;
        let backward = expected.checked_sub(distance).filter(|b| *b >= cursor);
        if forward > last && backward.is_none() {
            return None;
        }
        if forward <= last && matches_at(forward) {
            return Some(forward);
        }
        if let Some(b) = backward {
            if distance > 0 && matches_at(b) {
                return Some(b);
            }
        }
        distance += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tree(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        dir
    }

    fn apply(dir: &tempfile::TempDir, diff: &str) -> Result<ApplyResult, PatchError> {
        let patch = PatchSet::parse(diff).unwrap();
        PatchApplicator::new().apply_to_tree(dir.path(), &patch)
    }

    fn read(dir: &tempfile::TempDir, path: &str) -> String {
        fs::read_to_string(dir.path().join(path)).unwrap()
    }

    const MODIFY: &str = "\
diff --git a/calc.py b/calc.py
--- a/calc.py
+++ b/calc.py
@@ -1,3 +1,3 @@
 def add(a, b):
-    return a - b
+    return a + b

";

    #[test]
    fn test_modify_in_place() {
        let dir = tree(&[("calc.py", "def add(a, b):\n    return a - b\n\n")]);
        let result = apply(&dir, MODIFY).unwrap();
        assert_eq!(read(&dir, "calc.py"), "def add(a, b):\n    return a + b\n\n");
        assert_eq!(result.files[0].change, FileChange::Modified);
        assert_eq!(result.offset_hunks, 0);
    }

    #[test]
    fn test_hunk_found_at_offset() {
        let dir = tree(&[(
            "calc.py",
            "import os\nimport sys\n\ndef add(a, b):\n    return a - b\n\n",
        )]);
        let result = apply(&dir, MODIFY).unwrap();
        assert!(read(&dir, "calc.py").contains("return a + b"));
        assert_eq!(result.offset_hunks, 1);
    }

    #[test]
    fn test_context_mismatch_reports_hunk_and_writes_nothing() {
        let diff = "\
diff --git a/a.txt b/a.txt
--- a/a.txt
+++ b/a.txt
@@ -1,2 +1,2 @@
-one
+ONE
 two
diff --git a/b.txt b/b.txt
--- a/b.txt
+++ b/b.txt
@@ -1,2 +1,2 @@
 alpha
-beta
+BETA
@@ -5,2 +5,2 @@ fn tail
 epsilon
-zeta
+ZETA
";
        let dir = tree(&[
            ("a.txt", "one\ntwo\n"),
            ("b.txt", "alpha\nbeta\ngamma\ndelta\nepsilon\nomega\n"),
        ]);
        let err = apply(&dir, diff).unwrap_err();
        match err {
            PatchError::Conflict(conflict) => {
                assert_eq!(conflict.path, "b.txt");
                assert_eq!(conflict.hunk_index, Some(2));
                assert_eq!(conflict.header.as_deref(), Some("@@ -5,2 +5,2 @@ fn tail"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The first file applied cleanly in the overlay but was not written.
        assert_eq!(read(&dir, "a.txt"), "one\ntwo\n");
        assert_eq!(read(&dir, "b.txt"), "alpha\nbeta\ngamma\ndelta\nepsilon\nomega\n");
    }

    #[test]
    fn test_create_delete_and_rename() {
        let diff = "\
diff --git a/new/module.py b/new/module.py
new file mode 100644
--- /dev/null
+++ b/new/module.py
@@ -0,0 +1,2 @@
+x = 1
+y = 2
diff --git a/gone.txt b/gone.txt
deleted file mode 100644
--- a/gone.txt
+++ /dev/null
@@ -1 +0,0 @@
-bye
diff --git a/old.txt b/renamed.txt
similarity index 90%
rename from old.txt
rename to renamed.txt
--- a/old.txt
+++ b/renamed.txt
@@ -1,2 +1,2 @@
 keep
-drop
+added
";
        let dir = tree(&[("gone.txt", "bye\n"), ("old.txt", "keep\ndrop\n")]);
        let result = apply(&dir, diff).unwrap();

        assert_eq!(read(&dir, "new/module.py"), "x = 1\ny = 2\n");
        assert!(!dir.path().join("gone.txt").exists());
        assert!(!dir.path().join("old.txt").exists());
        assert_eq!(read(&dir, "renamed.txt"), "keep\nadded\n");
        assert_eq!(
            result.files.iter().map(|f| f.change.clone()).collect::<Vec<_>>(),
            vec![
                FileChange::Created,
                FileChange::Deleted,
                FileChange::Renamed {
                    from: "old.txt".to_string()
                }
            ]
        );
    }

    #[test]
    fn test_missing_trailing_newline_both_ways() {
        let add_newline = "\
diff --git a/f.txt b/f.txt
--- a/f.txt
+++ b/f.txt
@@ -1,2 +1,2 @@
 a
-b
\\ No newline at end of file
+b
";
        let dir = tree(&[("f.txt", "a\nb")]);
        apply(&dir, add_newline).unwrap();
        assert_eq!(read(&dir, "f.txt"), "a\nb\n");

        let drop_newline = "\
diff --git a/f.txt b/f.txt
--- a/f.txt
+++ b/f.txt
@@ -1,2 +1,2 @@
 a
-b
+c
\\ No newline at end of file
";
        apply(&dir, drop_newline).unwrap();
        assert_eq!(read(&dir, "f.txt"), "a\nc");
    }

    #[test]
    fn test_creating_existing_file_conflicts() {
        let diff = "\
diff --git a/a.txt b/a.txt
new file mode 100644
--- /dev/null
+++ b/a.txt
@@ -0,0 +1 @@
+fresh
";
        let dir = tree(&[("a.txt", "stale\n")]);
        let err = apply(&dir, diff).unwrap_err();
        assert!(matches!(
            err,
            PatchError::Conflict(PatchConflictError { hunk_index: None, .. })
        ));
        assert_eq!(read(&dir, "a.txt"), "stale\n");
    }

    #[test]
    fn test_modifying_missing_file_conflicts() {
        let dir = tree(&[]);
        let err = apply(&dir, MODIFY).unwrap_err();
        assert!(matches!(err, PatchError::Conflict(c) if c.path == "calc.py"));
    }

    #[test]
    fn test_rejects_paths_outside_tree() {
        let diff = "\
diff --git a/../escape.txt b/../escape.txt
new file mode 100644
--- /dev/null
+++ b/../escape.txt
@@ -0,0 +1 @@
+nope
";
        let dir = tree(&[]);
        assert!(matches!(apply(&dir, diff), Err(PatchError::UnsafePath(_))));

        let git_dir = "\
diff --git a/.git/config b/.git/config
new file mode 100644
--- /dev/null
+++ b/.git/config
@@ -0,0 +1 @@
+nope
";
        assert!(matches!(apply(&dir, git_dir), Err(PatchError::UnsafePath(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_mode_change_sets_executable_bit() {
        use std::os::unix::fs::PermissionsExt;
        let diff = "\
diff --git a/run.sh b/run.sh
old mode 100644
new mode 100755
";
        let dir = tree(&[("run.sh", "#!/bin/sh\n")]);
        apply(&dir, diff).unwrap();
        let mode = fs::metadata(dir.path().join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        assert_eq!(read(&dir, "run.sh"), "#!/bin/sh\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_rename_without_mode_keeps_executable_bit() {
        use std::os::unix::fs::PermissionsExt;
        let diff = "\
diff --git a/tools/run.sh b/scripts/run.sh
similarity index 80%
rename from tools/run.sh
rename to scripts/run.sh
--- a/tools/run.sh
+++ b/scripts/run.sh
@@ -1,2 +1,2 @@
 #!/bin/sh
-echo old
+echo new
";
        let dir = tree(&[("tools/run.sh", "#!/bin/sh\necho old\n")]);
        fs::set_permissions(dir.path().join("tools/run.sh"), fs::Permissions::from_mode(0o755)).unwrap();
        apply(&dir, diff).unwrap();

        let mode = fs::metadata(dir.path().join("scripts/run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        assert_eq!(read(&dir, "scripts/run.sh"), "#!/bin/sh\necho new\n");
    }

    #[test]
    fn test_locate_prefers_nearest_then_forward() {
        let lines: Vec<String> = ["x\n", "a\n", "x\n", "a\n", "x\n"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let needle = vec!["a\n".to_string()];
        assert_eq!(locate(&lines, &needle, 0, 2), Some(3));
        assert_eq!(locate(&lines, &needle, 0, 1), Some(1));
        assert_eq!(locate(&lines, &needle, 2, 0), Some(3));
        assert_eq!(locate(&lines, &["z\n".to_string()], 0, 0), None);
    }
}
