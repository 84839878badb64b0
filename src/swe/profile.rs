//! Per-repository evaluation profile, loaded from YAML.
//!
//! ```yaml
//! repo: octo/widgets
//! image: python:3.12-slim
//! install:
//!   - pip install -e .[test]
//! test_framework: pytest
//! test_command: python -m pytest -rA {tests}
//! test_prefixes: [tests]
//! ignore_prefixes: [.github, docs]
//! env:
//!   PYTHONDONTWRITEBYTECODE: "1"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::runner::frameworks::TestFramework;
use crate::swe::extractor::GoldPatchExtractorConfig;
use crate::swe::{validate_relative_path, RepoRef};

/// Placeholder replaced by the shell-quoted test selection.
pub const TESTS_PLACEHOLDER: &str = "{tests}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoProfile {
    pub repo: String,
    #[serde(default)]
    pub image: Option<String>,
    /// Run in order inside a fresh environment before anything else.
    #[serde(default)]
    pub install: Vec<String>,
    #[serde(default)]
    pub test_framework: TestFramework,
    /// Template with an optional `{tests}` placeholder.
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub test_prefixes: Vec<String>,
    #[serde(default = "default_ignore_prefixes")]
    pub ignore_prefixes: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_setup_timeout")]
    pub setup_timeout_secs: u64,
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default = "default_network")]
    pub network: bool,
}

fn default_ignore_prefixes() -> Vec<String> {
    vec![".github".to_string()]
}

fn default_setup_timeout() -> u64 {
    1800
}

fn default_test_timeout() -> u64 {
    900
}

fn default_network() -> bool {
    true
}

impl RepoProfile {
    /// A profile with the framework's stock image and install step.
    pub fn for_repo(repo: &RepoRef, framework: TestFramework) -> Self {
        let (image, install) = match framework {
            TestFramework::Pytest => ("python:3.12-slim", "pip install -q -e ."),
            TestFramework::Cargo => ("rust:1-slim", "cargo fetch"),
            TestFramework::Go => ("golang:1.22", "go mod download"),
        };
        Self {
            repo: repo.full_name(),
            image: Some(image.to_string()),
            install: vec![install.to_string()],
            test_framework: framework,
            test_command: None,
            test_prefixes: Vec::new(),
            ignore_prefixes: default_ignore_prefixes(),
            env: BTreeMap::new(),
            setup_timeout_secs: default_setup_timeout(),
            test_timeout_secs: default_test_timeout(),
            memory_mb: None,
            network: default_network(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read profile {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("invalid profile {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let profile: Self = serde_yaml::from_str(content)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<()> {
        RepoRef::parse(&self.repo)?;
        for prefix in self.test_prefixes.iter().chain(&self.ignore_prefixes) {
            validate_relative_path(prefix.trim_end_matches('/'))
                .with_context(|| format!("bad prefix '{}'", prefix))?;
        }
        if self.setup_timeout_secs == 0 || self.test_timeout_secs == 0 {
            anyhow::bail!("timeouts must be positive");
        }
        if let Some(command) = &self.test_command {
            if command.trim().is_empty() {
                anyhow::bail!("test_command is empty");
            }
        }
        for key in self.env.keys() {
            let valid = !key.is_empty()
                && !key.starts_with(|c: char| c.is_ascii_digit())
                && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                anyhow::bail!("invalid environment variable name '{}'", key);
            }
        }
        Ok(())
    }

    pub fn repo_ref(&self) -> Result<RepoRef> {
        RepoRef::parse(&self.repo)
    }

    pub fn test_command_template(&self) -> &str {
        self.test_command
            .as_deref()
            .unwrap_or_else(|| self.test_framework.default_command())
    }

    /// Concrete command for `ids`; an empty selection runs everything.
    pub fn render_test_command(&self, ids: &[String]) -> String {
        render_test_command(self.test_framework, self.test_command_template(), ids)
    }

    pub fn extractor_config(&self) -> GoldPatchExtractorConfig {
        GoldPatchExtractorConfig::default()
            .with_test_prefixes(&self.test_prefixes)
            .with_ignore_prefixes(&self.ignore_prefixes)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

/// Substitute the framework's selection for `ids` into `template`, or append
/// it when the template has no `{tests}` placeholder.
pub fn render_test_command(framework: TestFramework, template: &str, ids: &[String]) -> String {
    let selection = framework.selection_args(ids);
    let command = if template.contains(TESTS_PLACEHOLDER) {
        template.replace(TESTS_PLACEHOLDER, &selection)
    } else if selection.is_empty() {
        template.to_string()
    } else {
        format!("{} {}", template, selection)
    };
    command.trim_end().to_string()
}
