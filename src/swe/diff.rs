//! Unified diff model with exact round-tripping.
//!
//! Every parsed line keeps its original bytes (including the line
//! terminator), so `PatchSet::parse(text)?.render() == text` for any diff the
//! parser accepts. Paths and hunk ranges are derived views over those lines.

use std::fmt;
use std::str::FromStr;

use crate::error::DiffParseError;

/// Marker line git emits after a line lacking a trailing newline.
pub const NO_NEWLINE_MARKER: &str = "\\ No newline at end of file";

/// Classification of a line inside a hunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Context,
    Added,
    Removed,
    /// `\ No newline at end of file`, applies to the preceding line.
    NoNewline,
}

/// One line of a hunk body, stored verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunkLine {
    pub kind: LineKind,
    raw: String,
}

impl HunkLine {
    pub fn new(kind: LineKind, raw: impl Into<String>) -> Self {
        Self {
            kind,
            raw: raw.into(),
        }
    }

    /// The line exactly as it appeared in the diff.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Line content without the diff marker, including its terminator.
    pub fn text(&self) -> &str {
        match self.kind {
            LineKind::NoNewline => "",
            _ => match self.raw.chars().next() {
                Some(' ') | Some('+') | Some('-') => &self.raw[1..],
                // Some tools strip the space from empty context lines.
                _ => &self.raw,
            },
        }
    }
}

/// A single `@@ -a,b +c,d @@` hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    header: String,
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// The raw header line, e.g. `@@ -1,3 +1,4 @@ def foo():\n`.
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Text after the closing `@@`, usually the enclosing function.
    pub fn section(&self) -> &str {
        let line = self.header.trim_end_matches(['\n', '\r']);
        match line.get(2..).and_then(|rest| rest.find("@@")) {
            Some(pos) => line[pos + 4..].trim_start(),
            None => "",
        }
    }

    /// Lines the hunk expects to find in the original file.
    pub fn old_lines(&self) -> Vec<String> {
        self.side(|kind| matches!(kind, LineKind::Context | LineKind::Removed))
    }

    /// Lines the hunk leaves in the patched file.
    pub fn new_lines(&self) -> Vec<String> {
        self.side(|kind| matches!(kind, LineKind::Context | LineKind::Added))
    }

    fn side(&self, include: impl Fn(LineKind) -> bool) -> Vec<String> {
        let mut out = Vec::new();
        for (idx, line) in self.lines.iter().enumerate() {
            if !include(line.kind) {
                continue;
            }
            let mut text = line.text().to_string();
            let next_is_marker = self
                .lines
                .get(idx + 1)
                .is_some_and(|l| l.kind == LineKind::NoNewline);
            if next_is_marker {
                if text.ends_with('\n') {
                    text.pop();
                }
            } else if !text.ends_with('\n') {
                text.push('\n');
            }
            out.push(text);
        }
        out
    }

    fn render_into(&self, out: &mut String) {
        out.push_str(&self.header);
        for line in &self.lines {
            out.push_str(line.raw());
        }
    }
}

/// One file section of a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    header: Vec<String>,
    pub hunks: Vec<Hunk>,
    trailer: Vec<String>,
    old_path: Option<String>,
    new_path: Option<String>,
    new_mode: Option<String>,
    binary: bool,
}

impl FileDiff {
    /// Path before the change; `None` when the file is created.
    pub fn old_path(&self) -> Option<&str> {
        self.old_path.as_deref()
    }

    /// Path after the change; `None` when the file is deleted.
    pub fn new_path(&self) -> Option<&str> {
        self.new_path.as_deref()
    }

    /// The path most useful for display: new path, else old path.
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    /// Every distinct path the section touches.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.old_path.iter().map(String::as_str).collect();
        if let Some(new) = self.new_path.as_deref() {
            if !paths.contains(&new) {
                paths.push(new);
            }
        }
        paths
    }

    pub fn is_new_file(&self) -> bool {
        self.old_path.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.new_path.is_none()
    }

    pub fn is_rename(&self) -> bool {
        self.header.iter().any(|l| l.starts_with("rename from "))
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// Mode the file should end up with, when the diff sets one.
    pub fn new_mode(&self) -> Option<&str> {
        self.new_mode.as_deref()
    }

    pub fn header_lines(&self) -> &[String] {
        &self.header
    }

    /// Number of `+` and `-` lines across all hunks.
    pub fn line_counts(&self) -> (usize, usize) {
        let mut added = 0;
        let mut removed = 0;
        for line in self.hunks.iter().flat_map(|h| &h.lines) {
            match line.kind {
                LineKind::Added => added += 1,
                LineKind::Removed => removed += 1,
                _ => {}
            }
        }
        (added, removed)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        for line in &self.header {
            out.push_str(line);
        }
        for hunk in &self.hunks {
            hunk.render_into(out);
        }
        for line in &self.trailer {
            out.push_str(line);
        }
    }

    fn from_parts(header: Vec<String>, hunks: Vec<Hunk>, trailer: Vec<String>) -> Self {
        let meta = HeaderMeta::from_lines(&header);
        Self {
            header,
            hunks,
            trailer,
            old_path: meta.old_path,
            new_path: meta.new_path,
            new_mode: meta.new_mode,
            binary: meta.binary,
        }
    }
}

/// An ordered collection of file sections plus any leading text
/// (commit message, `git format-patch` headers).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSet {
    pub preamble: String,
    pub files: Vec<FileDiff>,
}

impl PatchSet {
    /// Build a patch from file sections, dropping any preamble.
    pub fn from_files(files: Vec<FileDiff>) -> Self {
        Self {
            preamble: String::new(),
            files,
        }
    }

    pub fn parse(text: &str) -> Result<Self, DiffParseError> {
        Parser::new(text).parse()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = self.preamble.clone();
        for file in &self.files {
            file.render_into(&mut out);
        }
        out
    }

    /// Display paths of every file section, in diff order.
    pub fn paths(&self) -> Vec<&str> {
        self.files.iter().map(FileDiff::path).collect()
    }
}

impl fmt::Display for PatchSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromStr for PatchSet {
    type Err = DiffParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

struct Parser<'a> {
    lines: Vec<&'a str>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.split_inclusive('\n').collect(),
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<PatchSet, DiffParseError> {
        let mut preamble = String::new();
        while self.pos < self.lines.len() && !self.at_file_start() {
            if self.lines[self.pos].starts_with("@@ ") {
                return Err(DiffParseError::OrphanHunk { line: self.pos + 1 });
            }
            preamble.push_str(self.lines[self.pos]);
            self.pos += 1;
        }

        let mut files = Vec::new();
        while self.pos < self.lines.len() {
            files.push(self.parse_file()?);
        }
        Ok(PatchSet { preamble, files })
    }

    fn at_file_start(&self) -> bool {
        let Some(line) = self.lines.get(self.pos) else {
            return false;
        };
        if line.starts_with("diff --git ") {
            return true;
        }
        line.starts_with("--- ")
            && self
                .lines
                .get(self.pos + 1)
                .is_some_and(|next| next.starts_with("+++ "))
    }

    fn parse_file(&mut self) -> Result<FileDiff, DiffParseError> {
        let mut header = vec![self.lines[self.pos].to_string()];
        let is_git = self.lines[self.pos].starts_with("diff --git ");
        self.pos += 1;

        if is_git {
            while let Some(line) = self.lines.get(self.pos) {
                if line.starts_with("@@ ") || line.starts_with("diff --git ") {
                    break;
                }
                header.push(line.to_string());
                self.pos += 1;
            }
        } else {
            // `--- ` was consumed above; the `+++ ` line is guaranteed by at_file_start.
            header.push(self.lines[self.pos].to_string());
            self.pos += 1;
        }

        let mut hunks = Vec::new();
        while self
            .lines
            .get(self.pos)
            .is_some_and(|l| l.starts_with("@@ "))
        {
            hunks.push(self.parse_hunk()?);
        }

        let mut trailer = Vec::new();
        while self.pos < self.lines.len() && !self.at_file_start() {
            if self.lines[self.pos].starts_with("@@ ") {
                return Err(DiffParseError::OrphanHunk { line: self.pos + 1 });
            }
            trailer.push(self.lines[self.pos].to_string());
            self.pos += 1;
        }

        Ok(FileDiff::from_parts(header, hunks, trailer))
    }

    fn parse_hunk(&mut self) -> Result<Hunk, DiffParseError> {
        let header_line = self.pos + 1;
        let header = self.lines[self.pos].to_string();
        let (old_start, old_len, new_start, new_len) =
            parse_hunk_range(&header).ok_or_else(|| DiffParseError::BadHunkHeader {
                line: header_line,
                header: header.trim_end().to_string(),
            })?;
        self.pos += 1;

        let mut lines = Vec::new();
        let (mut old_left, mut new_left) = (old_len, new_len);
        while old_left > 0 || new_left > 0 {
            let Some(raw) = self.lines.get(self.pos) else {
                return Err(DiffParseError::TruncatedHunk {
                    line: self.pos + 1,
                    header: header.trim_end().to_string(),
                });
            };
            let kind = match raw.as_bytes().first() {
                Some(b' ') | Some(b'\n') | Some(b'\r') => LineKind::Context,
                Some(b'+') => LineKind::Added,
                Some(b'-') => LineKind::Removed,
                Some(b'\\') => LineKind::NoNewline,
                _ => {
                    return Err(DiffParseError::TruncatedHunk {
                        line: self.pos + 1,
                        header: header.trim_end().to_string(),
                    })
                }
            };
            let fits = match kind {
                LineKind::Context => old_left > 0 && new_left > 0,
                LineKind::Removed => old_left > 0,
                LineKind::Added => new_left > 0,
                LineKind::NoNewline => true,
            };
            if !fits {
                return Err(DiffParseError::UnexpectedLine {
                    line: self.pos + 1,
                    content: raw.trim_end().to_string(),
                });
            }
            match kind {
                LineKind::Context => {
                    old_left -= 1;
                    new_left -= 1;
                }
                LineKind::Removed => old_left -= 1,
                LineKind::Added => new_left -= 1,
                LineKind::NoNewline => {}
            }
            lines.push(HunkLine::new(kind, *raw));
            self.pos += 1;
        }

        if let Some(raw) = self.lines.get(self.pos) {
            if raw.starts_with('\\') {
                lines.push(HunkLine::new(LineKind::NoNewline, *raw));
                self.pos += 1;
            }
        }

        Ok(Hunk {
            header,
            old_start,
            old_len,
            new_start,
            new_len,
            lines,
        })
    }
}

/// Parse `@@ -a[,b] +c[,d] @@` into `(a, b, c, d)`; omitted lengths are 1.
fn parse_hunk_range(header: &str) -> Option<(usize, usize, usize, usize)> {
    let rest = header.strip_prefix("@@ -")?;
    let end = rest.find(" @@")?;
    let (old, new) = rest[..end].split_once(" +")?;
    let (old_start, old_len) = parse_range(old)?;
    let (new_start, new_len) = parse_range(new)?;
    Some((old_start, old_len, new_start, new_len))
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

#[derive(Default)]
struct HeaderMeta {
    old_path: Option<String>,
    new_path: Option<String>,
    new_mode: Option<String>,
    binary: bool,
}

impl HeaderMeta {
    fn from_lines(header: &[String]) -> Self {
        let mut meta = HeaderMeta::default();
        let mut minus: Option<Option<String>> = None;
        let mut plus: Option<Option<String>> = None;
        let mut moved_from = None;
        let mut moved_to = None;
        let mut created = false;
        let mut deleted = false;

        for raw in header {
            let line = raw.trim_end_matches(['\n', '\r']);
            if let Some(p) = line.strip_prefix("--- ") {
                minus = Some(side_path(p, "a/"));
            } else if let Some(p) = line.strip_prefix("+++ ") {
                plus = Some(side_path(p, "b/"));
            } else if let Some(p) = line
                .strip_prefix("rename from ")
                .or_else(|| line.strip_prefix("copy from "))
            {
                moved_from = Some(unquote(p));
            } else if let Some(p) = line
                .strip_prefix("rename to ")
                .or_else(|| line.strip_prefix("copy to "))
            {
                moved_to = Some(unquote(p));
            } else if let Some(mode) = line.strip_prefix("new file mode ") {
                created = true;
                meta.new_mode = Some(mode.to_string());
            } else if line.starts_with("deleted file mode ") {
                deleted = true;
            } else if let Some(mode) = line.strip_prefix("new mode ") {
                meta.new_mode = Some(mode.to_string());
            } else if line.starts_with("Binary files ") || line == "GIT binary patch" {
                meta.binary = true;
            }
        }

        let from_git_line = header
            .first()
            .and_then(|l| git_line_paths(l.trim_end_matches(['\n', '\r'])));

        meta.old_path = match (moved_from, minus) {
            (Some(p), _) => Some(p),
            (None, Some(p)) => p,
            (None, None) => from_git_line.as_ref().map(|(a, _)| a.clone()),
        };
        meta.new_path = match (moved_to, plus) {
            (Some(p), _) => Some(p),
            (None, Some(p)) => p,
            (None, None) => from_git_line.map(|(_, b)| b),
        };
        if created {
            meta.old_path = None;
        }
        if deleted {
            meta.new_path = None;
        }
        meta
    }
}

/// Path from a `---`/`+++` line; `None` for `/dev/null`.
fn side_path(value: &str, prefix: &str) -> Option<String> {
    // Non-git diffs may carry a tab-separated timestamp.
    let value = value.split('\t').next().unwrap_or(value);
    let path = unquote(value);
    if path == "/dev/null" {
        return None;
    }
    Some(path.strip_prefix(prefix).unwrap_or(&path).to_string())
}

/// Paths from `diff --git a/X b/Y`. When X and Y are equal the split is
/// unambiguous even if the path contains spaces.
fn git_line_paths(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("diff --git ")?;
    if rest.starts_with('"') {
        let (a, b) = rest.split_once("\" ")?;
        let a = unquote(&format!("{}\"", a));
        let b = unquote(b);
        return Some((
            a.strip_prefix("a/").unwrap_or(&a).to_string(),
            b.strip_prefix("b/").unwrap_or(&b).to_string(),
        ));
    }
    let body = rest.strip_prefix("a/")?;
    if body.len() >= 3 && (body.len() - 3) % 2 == 0 {
        let half = (body.len() - 3) / 2;
        if body.is_char_boundary(half) && body.is_char_boundary(half + 3) {
            let (a, b) = (&body[..half], &body[half..]);
            if let Some(b) = b.strip_prefix(" b/") {
                if a == b {
                    return Some((a.to_string(), b.to_string()));
                }
            }
        }
    }
    let (a, b) = body.split_once(" b/")?;
    Some((a.to_string(), b.to_string()))
}

/// Strip git's C-style quoting from a path, handling the common escapes.
fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
