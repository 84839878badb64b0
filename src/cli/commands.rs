//! CLI command definitions for swe-harvest.
//!
//! Two commands: `mine` builds or extends a JSONL dataset from a repository's
//! closed issues, `evaluate` scores an agent against such a dataset.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::execution::{
    DockerExecutor, EnvironmentConfig, EnvironmentManager, Executor, ExecutorKind, GitMirror,
    LocalExecutor,
};
use crate::runner::{create_agent, AgentType, Evaluator, EvaluatorConfig, TestFramework};
use crate::swe::github::GithubClientConfig;
use crate::swe::{
    DatasetAccumulator, DatasetPipeline, GithubClient, LinkerConfig, PipelineConfig, RepoProfile,
    RepoRef,
};

/// Default directory for bare mirrors used by `evaluate`.
const DEFAULT_MIRROR_DIR: &str = "./.swe-harvest/mirrors";

/// Mine issue-to-fix benchmark items and evaluate agents against them.
#[derive(Parser)]
#[command(name = "swe-harvest")]
#[command(about = "Mine issue-to-fix benchmark items from GitHub and evaluate agent patches")]
#[command(version)]
#[command(
    long_about = "swe-harvest turns closed GitHub issues resolved by a merged pull request into benchmark items (problem statement, base commit, gold patch, test patch, expected-pass tests) and scores coding agents against them in isolated environments.\n\nExample usage:\n  swe-harvest mine --repo psf/requests --max-issues 200 --output requests.jsonl\n  swe-harvest evaluate --dataset requests.jsonl --agent gold --executor docker -j 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Build or extend a dataset from a repository's closed issues.
    Mine(MineArgs),

    /// Evaluate an agent against a dataset.
    #[command(alias = "eval")]
    Evaluate(EvaluateArgs),
}

/// Arguments for `swe-harvest mine`.
#[derive(Parser, Debug)]
pub struct MineArgs {
    /// Repository to mine, as owner/name.
    #[arg(short, long)]
    pub repo: String,

    /// Maximum number of issues to fetch in this run.
    #[arg(short = 'n', long)]
    pub max_issues: Option<usize>,

    /// Issue listing page to start from (resume point).
    #[arg(long, default_value = "1")]
    pub start_page: u32,

    /// Repository profile (YAML). Defaults are derived from --framework.
    #[arg(short, long)]
    pub profile: Option<PathBuf>,

    /// Test framework used when no profile is given (pytest, cargo, go).
    #[arg(long, default_value = "pytest")]
    pub framework: TestFramework,

    /// Dataset file; existing records are kept and only new issues added.
    #[arg(short, long)]
    pub output: PathBuf,

    /// GitHub token.
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// GitHub API base URL.
    #[arg(long)]
    pub api_base: Option<String>,

    /// Issues processed concurrently.
    #[arg(short = 'c', long, default_value = "4")]
    pub concurrency: usize,

    /// Pages of closed pull requests to scan for closing keywords.
    #[arg(long, default_value = "0")]
    pub pull_history_pages: u32,

    /// Accept a single free-text mention as a link when nothing stronger exists.
    #[arg(long)]
    pub allow_free_text: bool,

    /// Skip fetching issue comment threads.
    #[arg(long)]
    pub no_comments: bool,

    /// Output the run report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `swe-harvest evaluate`.
#[derive(Parser, Debug)]
pub struct EvaluateArgs {
    /// Dataset file produced by `mine`.
    #[arg(short, long)]
    pub dataset: PathBuf,

    /// Repository profile (YAML). Defaults are derived from the dataset.
    #[arg(short, long)]
    pub profile: Option<PathBuf>,

    /// Agent proposing patches (gold, null, command).
    #[arg(short, long, default_value = "gold")]
    pub agent: AgentType,

    /// Command template for the command agent; `{problem}` is replaced by
    /// the quoted problem statement.
    #[arg(long)]
    pub agent_command: Option<String>,

    /// Agent time limit in seconds (command agent).
    #[arg(long, default_value = "1800")]
    pub agent_timeout: u64,

    /// Where commands run (docker, local).
    #[arg(short, long, default_value = "docker")]
    pub executor: ExecutorKind,

    /// Data points evaluated concurrently.
    #[arg(short = 'j', long, default_value = "2")]
    pub jobs: usize,

    /// Write the evaluation summary (JSON) here.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Only evaluate these instance ids (repeatable).
    #[arg(long = "instance")]
    pub instances: Vec<String>,

    /// Evaluate at most this many data points.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Clone URL of the repository; defaults to its GitHub URL.
    #[arg(long)]
    pub repo_url: Option<String>,

    /// Directory holding bare mirrors.
    #[arg(long, default_value = DEFAULT_MIRROR_DIR)]
    pub mirror_dir: PathBuf,

    /// Directory for per-environment working trees.
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Run the whole test suite so regressions are recorded.
    #[arg(long)]
    pub full_suite: bool,

    /// Give a timed-out test run one more attempt.
    #[arg(long)]
    pub retry_timeouts: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Mine(args) => run_mine_command(args).await,
        Commands::Evaluate(args) => run_evaluate_command(args).await,
    }
}

/// Cancel `token` on Ctrl-C so in-flight work stops and cleans up.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after in-flight work is torn down");
            token.cancel();
        }
    });
}

fn load_profile(path: Option<&Path>, repo: &RepoRef, framework: TestFramework) -> anyhow::Result<RepoProfile> {
    match path {
        Some(path) => {
            let profile = RepoProfile::load(path)?;
            if !repo.is(&profile.repo) {
                anyhow::bail!(
                    "profile {} is for '{}', not '{}'",
                    path.display(),
                    profile.repo,
                    repo
                );
            }
            Ok(profile)
        }
        None => Ok(RepoProfile::for_repo(repo, framework)),
    }
}

// ============================================================================
// mine
// ============================================================================

#[derive(Serialize)]
struct MineOutput<'a> {
    repo: String,
    output: String,
    records: usize,
    report: &'a crate::swe::PipelineReport,
}

async fn run_mine_command(args: MineArgs) -> anyhow::Result<()> {
    let repo = RepoRef::parse(&args.repo)?;
    let profile = load_profile(args.profile.as_deref(), &repo, args.framework)?;

    let mut client_config = GithubClientConfig::default().with_token(args.token.clone());
    if let Some(base) = &args.api_base {
        client_config = client_config.with_api_base(base.clone());
    }
    let tracker = Arc::new(GithubClient::new(repo.clone(), client_config)?);

    let linker_config = LinkerConfig::default().with_free_text(args.allow_free_text);
    let pipeline = DatasetPipeline::new(tracker, &profile, linker_config)?;

    let mut config = PipelineConfig::default()
        .with_max_issues(args.max_issues)
        .with_start_page(args.start_page)
        .with_concurrency(args.concurrency)
        .with_pull_history_pages(args.pull_history_pages);
    config.fetch_comments = !args.no_comments;

    let mut dataset = DatasetAccumulator::load_jsonl(&args.output)?;
    info!(
        repo = %repo,
        existing = dataset.len(),
        output = %args.output.display(),
        "Mining dataset"
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let report = pipeline.run(&config, &mut dataset, &cancel, None).await?;

    dataset
        .write_jsonl(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    if args.json {
        let output = MineOutput {
            repo: repo.full_name(),
            output: args.output.display().to_string(),
            records: dataset.len(),
            report: &report,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("✓ Mining completed for {}", repo);
        println!("  Output:     {}", args.output.display());
        println!("  Records:    {}", dataset.len());
        println!(
            "  Issues:     {} fetched, {} already present, {} added, {} skipped",
            report.fetched,
            report.already_present,
            report.emitted.len(),
            report.skipped.len()
        );
        for (kind, count) in report.skipped_by_kind() {
            println!("    {}: {}", kind, count);
        }
        if let Some(page) = report.last_page {
            println!("  Resume with --start-page {}", page);
        }
        if let Some(error) = &report.stream_error {
            println!("  Stopped early: {}", error);
        }
    }
    Ok(())
}

// ============================================================================
// evaluate
// ============================================================================

async fn run_evaluate_command(args: EvaluateArgs) -> anyhow::Result<()> {
    let dataset = DatasetAccumulator::load_jsonl(&args.dataset)?;
    let mut data_points: Vec<_> = dataset
        .into_records()
        .into_iter()
        .filter(|dp| args.instances.is_empty() || args.instances.contains(&dp.instance_id))
        .collect();
    if let Some(limit) = args.limit {
        data_points.truncate(limit);
    }
    let Some(first) = data_points.first() else {
        anyhow::bail!("no data points to evaluate in {}", args.dataset.display());
    };

    let repo = RepoRef::parse(&first.repo)?;
    if let Some(other) = data_points.iter().find(|dp| !repo.is(&dp.repo)) {
        anyhow::bail!(
            "dataset mixes repositories ('{}' and '{}'); evaluate one repository at a time",
            repo,
            other.repo
        );
    }
    let profile = load_profile(args.profile.as_deref(), &repo, first.test_framework)?;

    let executor: Arc<dyn Executor> = match args.executor {
        ExecutorKind::Docker => Arc::new(
            DockerExecutor::connect()
                .await
                .context("Docker is not available; use --executor local to run on the host")?,
        ),
        ExecutorKind::Local => Arc::new(LocalExecutor::new()),
    };

    let remote = args.repo_url.clone().unwrap_or_else(|| repo.clone_url());
    let mirror_dir = args
        .mirror_dir
        .join(format!("{}__{}.git", repo.owner, repo.name));
    let source = Arc::new(GitMirror::new(remote, mirror_dir));

    let mut env_config = EnvironmentConfig::default();
    if let Some(dir) = &args.work_dir {
        env_config = env_config.with_root(dir.clone());
    }
    let manager = Arc::new(EnvironmentManager::new(
        executor,
        source,
        Arc::new(profile),
        env_config,
    ));

    let agent = match args.agent {
        AgentType::Command => {
            let template = args
                .agent_command
                .as_deref()
                .context("--agent command requires --agent-command")?;
            Arc::new(
                crate::runner::CommandAgent::new(template)
                    .with_timeout(std::time::Duration::from_secs(args.agent_timeout)),
            ) as Arc<dyn crate::runner::PatchAgent>
        }
        other => Arc::from(create_agent(other, args.agent_command.as_deref())?),
    };

    let config = EvaluatorConfig::default()
        .with_concurrency(args.jobs)
        .with_full_suite(args.full_suite)
        .with_timeout_retry(args.retry_timeouts);
    let evaluator = Evaluator::new(manager, agent, config);

    info!(
        repo = %repo,
        data_points = data_points.len(),
        agent = %args.agent,
        executor = %args.executor,
        "Evaluating dataset"
    );
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let summary = evaluator.evaluate(&data_points, &cancel).await;

    if let Some(path) = &args.output {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    }

    println!("\n=== Evaluation Results ===");
    println!("Total:          {}", summary.total);
    println!("Scored:         {}", summary.scored);
    println!("Resolved:       {}", summary.resolved);
    println!("Failed:         {}", summary.failed);
    println!("Resolved rate:  {:.1}%", summary.resolved_rate * 100.0);
    println!("Mean score:     {:.3}", summary.mean_score);
    for (label, count) in &summary.failures {
        println!("  {}: {}", label, count);
    }
    println!();
    for outcome in &summary.outcomes {
        let passed = outcome
            .expected_results
            .values()
            .filter(|s| **s == crate::runner::TestStatus::Pass)
            .count();
        println!(
            "  {} [{}] {}/{} expected{}",
            outcome.instance_id,
            outcome.state,
            passed,
            outcome.expected_pass.len(),
            if outcome.timed_out { " (timed out)" } else { "" }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_mine_command_defaults() {
        let cli = Cli::try_parse_from([
            "swe-harvest",
            "mine",
            "--repo",
            "psf/requests",
            "--output",
            "out.jsonl",
        ])
        .expect("should parse");
        match cli.command {
            Commands::Mine(args) => {
                assert_eq!(args.repo, "psf/requests");
                assert_eq!(args.start_page, 1);
                assert_eq!(args.concurrency, 4);
                assert_eq!(args.framework, TestFramework::Pytest);
                assert!(args.max_issues.is_none());
                assert!(!args.allow_free_text);
            }
            _ => panic!("Expected Mine command"),
        }
    }

    #[test]
    fn test_evaluate_command_with_options() {
        let cli = Cli::try_parse_from([
            "swe-harvest",
            "eval",
            "--dataset",
            "d.jsonl",
            "--agent",
            "command",
            "--agent-command",
            "claude -p {problem}",
            "--executor",
            "local",
            "-j",
            "8",
            "--instance",
            "a__b-1",
            "--instance",
            "a__b-2",
            "--log-level",
            "debug",
        ])
        .expect("should parse");
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Evaluate(args) => {
                assert_eq!(args.agent, AgentType::Command);
                assert_eq!(args.executor, ExecutorKind::Local);
                assert_eq!(args.jobs, 8);
                assert_eq!(args.instances.len(), 2);
                assert_eq!(args.mirror_dir, PathBuf::from(DEFAULT_MIRROR_DIR));
            }
            _ => panic!("Expected Evaluate command"),
        }
    }

    #[test]
    fn test_profile_must_match_repo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.yaml");
        std::fs::write(&path, "repo: acme/widgets\ntest_framework: go\n").unwrap();
        let widgets = RepoRef::parse("acme/widgets").unwrap();
        let other = RepoRef::parse("acme/gadgets").unwrap();

        let profile = load_profile(Some(&path), &widgets, TestFramework::Pytest).unwrap();
        assert_eq!(profile.test_framework, TestFramework::Go);
        assert!(load_profile(Some(&path), &other, TestFramework::Pytest).is_err());
        let default = load_profile(None, &other, TestFramework::Cargo).unwrap();
        assert_eq!(default.test_framework, TestFramework::Cargo);
    }
}
