//! Validation for values that end up inside shell commands or git
//! invocations: repository names, revisions, relative paths and test ids.

use std::path::{Component, Path};

use anyhow::Result;

/// Validate a GitHub repository name (`owner/repo`).
///
/// Both parts must be non-empty, must not start with `.` or `-`, and may
/// only contain alphanumerics, `-`, `_` and `.`.
pub fn validate_repo_name(repo: &str) -> Result<()> {
    if repo.is_empty() {
        anyhow::bail!("repository name is empty");
    }
    if repo.len() > 256 {
        anyhow::bail!("repository name too long ({} chars, max 256)", repo.len());
    }
    let Some((owner, name)) = repo.split_once('/') else {
        anyhow::bail!("invalid repository name '{}': expected 'owner/repo'", repo);
    };
    for part in [owner, name] {
        if part.is_empty() {
            anyhow::bail!("invalid repository name '{}': empty owner or repo", repo);
        }
        if part.starts_with('.') || part.starts_with('-') {
            anyhow::bail!(
                "invalid repository name '{}': parts must not start with '.' or '-'",
                repo
            );
        }
        if let Some(ch) = part
            .chars()
            .find(|ch| !matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.'))
        {
            anyhow::bail!("invalid character '{}' in repository name '{}'", ch, repo);
        }
    }
    Ok(())
}

/// Validate a git revision (full or short SHA, branch or tag name).
///
/// Rejects a leading `-` (flag injection), `..` (ranges and traversal) and
/// anything outside `[A-Za-z0-9/._~^-]`.
pub fn validate_git_ref(rev: &str) -> Result<()> {
    if rev.is_empty() {
        anyhow::bail!("git ref is empty");
    }
    if rev.len() > 256 {
        anyhow::bail!("git ref too long ({} chars, max 256)", rev.len());
    }
    if rev.starts_with('-') {
        anyhow::bail!("git ref '{}' must not start with '-'", rev);
    }
    if rev.contains("..") {
        anyhow::bail!("git ref '{}' must not contain '..'", rev);
    }
    if let Some(ch) = rev.chars().find(|ch| {
        !matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '/' | '.' | '-' | '_' | '~' | '^')
    }) {
        anyhow::bail!("invalid character '{}' in git ref '{}'", ch, rev);
    }
    Ok(())
}

/// Validate a path taken from a diff before it is joined onto a working tree.
///
/// The path must be relative and must stay inside the tree: no root, no
/// drive prefix, no `..` components, no NUL bytes.
pub fn validate_relative_path(path: &str) -> Result<()> {
    if path.is_empty() {
        anyhow::bail!("file path is empty");
    }
    if path.contains('\0') {
        anyhow::bail!("file path contains a NUL byte");
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                anyhow::bail!("file path '{}' escapes the working tree", path)
            }
            Component::RootDir | Component::Prefix(_) => {
                anyhow::bail!("file path '{}' must be relative", path)
            }
        }
    }
    Ok(())
}

/// Quote a value for safe interpolation into a POSIX `sh -c` command line.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ':' | '=' | ','))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_name_accepts_valid() {
        assert!(validate_repo_name("octo-org/hello.world").is_ok());
        assert!(validate_repo_name("a/b_c").is_ok());
    }

    #[test]
    fn test_repo_name_rejects_bad_shapes() {
        assert!(validate_repo_name("").is_err());
        assert!(validate_repo_name("noslash").is_err());
        assert!(validate_repo_name("a/b/c").is_err());
        assert!(validate_repo_name("/repo").is_err());
        assert!(validate_repo_name(".hidden/repo").is_err());
        assert!(validate_repo_name("owner/-flag").is_err());
        assert!(validate_repo_name("owner/repo;rm -rf /").is_err());
    }

    #[test]
    fn test_git_ref_accepts_shas_and_branches() {
        assert!(validate_git_ref("a1b2c3d").is_ok());
        assert!(validate_git_ref("0123456789abcdef0123456789abcdef01234567").is_ok());
        assert!(validate_git_ref("release/1.2").is_ok());
        assert!(validate_git_ref("HEAD~1").is_ok());
    }

    #[test]
    fn test_git_ref_rejects_injection() {
        assert!(validate_git_ref("").is_err());
        assert!(validate_git_ref("--upload-pack=evil").is_err());
        assert!(validate_git_ref("main..dev").is_err());
        assert!(validate_git_ref("abc$(whoami)").is_err());
        assert!(validate_git_ref(&"a".repeat(300)).is_err());
    }

    #[test]
    fn test_relative_path() {
        assert!(validate_relative_path("src/lib.rs").is_ok());
        assert!(validate_relative_path("./docs/a b.md").is_ok());
        assert!(validate_relative_path("../etc/passwd").is_err());
        assert!(validate_relative_path("src/../../x").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("").is_err());
        assert!(validate_relative_path("a\0b").is_err());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("tests/test_a.py::test_x"), "tests/test_a.py::test_x");
        assert_eq!(shell_quote("test_x[a b]"), "'test_x[a b]'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
