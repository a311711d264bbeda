//! mender - turns a failing CI log into a reviewable fix
//!
//! Reads the build log, diagnoses the first failure, commits a fix on a work
//! branch and opens a pull request for a human to review.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mender_adapters::config::LogOutput;
use mender_adapters::{Config, ConfigScope, GitRepositoryMutator, RepositoryMutator};
use mender_core::{FormatHint, StageCounter};
use mender_engine::{report, Orchestrator, OrchestratorSettings, ReasoningClient};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::Instrument;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "mender",
    about = "Turn a failing CI log into a reviewable fix",
    long_about = "Parses a failing build log, asks a reasoning service for a minimal fix,\n\
                  commits it on a work branch and opens a pull request for human review.\n\n\
                  Credentials and the target repository come from the environment\n\
                  (OPENAI_API_KEY, GITHUB_TOKEN, GITHUB_REPOSITORY).",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Diagnose and publish a fix for the first failure in a build log
    Heal {
        /// Build log to read (`-` for stdin)
        log: PathBuf,

        /// Try this test-report format first
        #[arg(long, value_enum)]
        format: Option<LogFormatArg>,

        /// Repository checkout to fix
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// Settings file (defaults to mender.toml in the repository)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write the final attempt record as JSON
        #[arg(long)]
        report_json: Option<PathBuf>,
    },
    /// Delete old work branches that have no open pull request
    CleanupBranches {
        /// Retention window (defaults to STALE_BRANCH_DAYS)
        #[arg(long)]
        older_than_days: Option<u32>,

        #[arg(long, default_value = ".")]
        repo: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormatArg {
    Pytest,
    CargoTest,
    Traceback,
}

impl From<LogFormatArg> for FormatHint {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pytest => FormatHint::Pytest,
            LogFormatArg::CargoTest => FormatHint::CargoTest,
            LogFormatArg::Traceback => FormatHint::Traceback,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{:#}", err), "mender failed");
            eprintln!("mender: {:#}", err);
            report::EXIT_INTERNAL
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Heal {
            log,
            format,
            repo,
            config,
            report_json,
        } => {
            let repo = canonical_repo(&repo)?;
            let Some(config) = load_config(ConfigScope::Heal, config.as_deref(), &repo) else {
                return Ok(report::EXIT_CONFIGURATION);
            };
            init_logging(&config.log_level, config.log_format);
            heal(&config, &repo, &log, format.map(FormatHint::from), report_json.as_deref()).await
        }
        Command::CleanupBranches {
            older_than_days,
            repo,
            config,
        } => {
            let repo = canonical_repo(&repo)?;
            let Some(config) = load_config(ConfigScope::Cleanup, config.as_deref(), &repo) else {
                return Ok(report::EXIT_CONFIGURATION);
            };
            init_logging(&config.log_level, config.log_format);
            cleanup(&config, &repo, older_than_days).await
        }
    }
}

fn canonical_repo(repo: &Path) -> Result<PathBuf> {
    repo.canonicalize()
        .with_context(|| format!("Repository path {} is not accessible", repo.display()))
}

/// Problems are printed before logging is set up; nothing else has run yet.
fn load_config(scope: ConfigScope, path: Option<&Path>, repo: &Path) -> Option<Config> {
    match Config::from_env(scope, path, repo) {
        Ok(config) => Some(config),
        Err(err) => {
            eprintln!("mender: invalid configuration");
            for problem in &err.problems {
                eprintln!("  - {}", problem);
            }
            None
        }
    }
}

fn init_logging(level: &str, output: LogOutput) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = match output {
        LogOutput::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogOutput::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    if let Err(err) = result {
        eprintln!("mender: logging unavailable: {}", err);
    }
}

fn read_log(path: &Path) -> Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("Failed to read build log from stdin")?;
        return Ok(buf);
    }
    std::fs::read(path).with_context(|| format!("Failed to read build log {}", path.display()))
}

async fn heal(
    config: &Config,
    repo: &Path,
    log: &Path,
    hint: Option<FormatHint>,
    report_json: Option<&Path>,
) -> Result<i32> {
    let raw_log = read_log(log)?;
    let reasoning = ReasoningClient::from_config(config)?;
    let mutator = GitRepositoryMutator::from_config(repo, config)?;
    let orchestrator = Orchestrator::new(
        &reasoning,
        &mutator,
        OrchestratorSettings::from_config(config),
    );

    let span = tracing::info_span!("remediation", run_id = %config.run_id);
    let run = orchestrator.run(&raw_log, hint).instrument(span);
    let attempt = match config.healing_timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(attempt) => attempt,
            Err(_) => {
                tracing::error!(timeout_secs = limit.as_secs(), "healing timed out");
                eprintln!(
                    "mender run {}: timed out after {}s; cancelled before a pull request was opened",
                    config.run_id,
                    limit.as_secs()
                );
                return Ok(report::EXIT_TIMEOUT);
            }
        },
        None => run.await,
    };

    if let Some(path) = report_json {
        let json = serde_json::to_string_pretty(&attempt).context("Failed to encode report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
    }
    eprint!("{}", report::summary(&attempt));
    Ok(report::exit_code(&attempt))
}

async fn cleanup(config: &Config, repo: &Path, older_than_days: Option<u32>) -> Result<i32> {
    let mutator = GitRepositoryMutator::from_config(repo, config)?;
    let window = older_than_days
        .map(|days| Duration::from_secs(u64::from(days) * 24 * 60 * 60))
        .unwrap_or_else(|| config.stale_branch_window());
    let mut counter = StageCounter::default();

    let span = tracing::info_span!("cleanup", run_id = %config.run_id);
    let result = mutator
        .cleanup_stale_branches(window, &mut counter)
        .instrument(span)
        .await;
    match result {
        Ok(outcome) => {
            for branch in &outcome.deleted {
                eprintln!("deleted  {}", branch);
            }
            for branch in &outcome.kept {
                eprintln!("kept     {}", branch);
            }
            eprintln!(
                "{} deleted, {} kept ({} calls, {} retried)",
                outcome.deleted.len(),
                outcome.kept.len(),
                counter.calls,
                counter.retries
            );
            Ok(report::EXIT_PUBLISHED)
        }
        Err(err) => {
            eprintln!("mender: branch cleanup failed: {}", err);
            Ok(report::EXIT_FAILED_PUBLISH)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heal_arguments() {
        let cli = Cli::try_parse_from([
            "mender",
            "heal",
            "build.log",
            "--format",
            "cargo-test",
            "--report-json",
            "out.json",
        ])
        .unwrap();
        let Command::Heal {
            log,
            format,
            repo,
            report_json,
            ..
        } = cli.command
        else {
            panic!("expected heal");
        };
        assert_eq!(log, PathBuf::from("build.log"));
        assert_eq!(format.map(FormatHint::from), Some(FormatHint::CargoTest));
        assert_eq!(repo, PathBuf::from("."));
        assert_eq!(report_json, Some(PathBuf::from("out.json")));
    }

    #[test]
    fn test_cleanup_arguments() {
        let cli = Cli::try_parse_from(["mender", "cleanup-branches", "--older-than-days", "30"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Command::CleanupBranches {
                older_than_days: Some(30),
                ..
            }
        ));
    }

    #[test]
    fn test_heal_requires_log_path() {
        assert!(Cli::try_parse_from(["mender", "heal"]).is_err());
    }

    #[test]
    fn test_read_log_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_log(&dir.path().join("missing.log")).unwrap_err();
        assert!(format!("{:#}", err).contains("missing.log"));
    }
}
