//! Command-line interface for ruleguard
//!
//! Argument parsing with clap derive; each subcommand lives in its own file
//! under `commands/` with an `Args` struct and an `execute` function.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;
mod output;

pub use output::Output;

use commands::{affected, cache, config, plan, profile, rules, run, version, worker};

/// ruleguard - incremental repository rule validation
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Run as if started in <DIR> instead of current working directory
    #[arg(short = 'C', long = "directory", global = true)]
    pub directory: Option<PathBuf>,

    /// Increase verbosity (can be repeated)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Use custom configuration file
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the repository against the rule catalog
    Run(run::RunArgs),
    /// Print the dependency batches of the catalog
    Plan(plan::PlanArgs),
    /// Show which rules a change set affects
    Affected(affected::AffectedArgs),
    /// List the rule catalog
    Rules(rules::RulesArgs),
    /// Inspect or clear the result cache
    #[command(subcommand)]
    Cache(cache::CacheCommands),
    /// Inspect or reset execution profiles
    #[command(subcommand)]
    Profile(profile::ProfileCommands),
    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
    /// Show version information
    Version,
    /// Evaluate one rule and print its result envelope (process isolation)
    #[command(hide = true)]
    Worker(worker::WorkerArgs),
}

/// Global options every command receives
pub struct Globals {
    pub config: Option<PathBuf>,
    pub verbose: u8,
    pub quiet: bool,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        if let Some(dir) = &self.directory {
            std::env::set_current_dir(dir)
                .with_context(|| format!("Cannot change directory to {}", dir.display()))?;
        }

        // Workers report through stdout only; logging would interleave with the envelope
        let is_worker = matches!(self.command, Some(Commands::Worker(_)));
        setup_logging(self.verbose, self.quiet || is_worker);

        let output = Output::new(self.verbose > 0, self.quiet);
        let globals = Globals {
            config: self.config,
            verbose: self.verbose,
            quiet: self.quiet,
        };

        match self.command {
            Some(Commands::Run(args)) => run::execute(args, &globals, &output).await,
            Some(Commands::Plan(args)) => plan::execute(args, &globals, &output).await,
            Some(Commands::Affected(args)) => affected::execute(args, &globals, &output).await,
            Some(Commands::Rules(args)) => rules::execute(args, &globals, &output).await,
            Some(Commands::Cache(cmd)) => cache::execute(cmd, &globals, &output).await,
            Some(Commands::Profile(cmd)) => profile::execute(cmd, &globals, &output).await,
            Some(Commands::Config(cmd)) => config::execute(cmd, &globals).await,
            Some(Commands::Version) => version::execute(&output).await,
            Some(Commands::Worker(args)) => worker::execute(args, &globals).await,
            None => {
                let mut cmd = Cli::command();
                cmd.print_help()?;
                Ok(())
            }
        }
    }
}

fn setup_logging(verbose: u8, quiet: bool) {
    if quiet {
        return;
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => tracing_subscriber::EnvFilter::new("warn"),
        1 => tracing_subscriber::EnvFilter::new("info,ignore=warn,globset=warn"),
        2 => tracing_subscriber::EnvFilter::new("debug,ignore=warn,globset=warn"),
        _ => tracing_subscriber::EnvFilter::new("trace"),
    });

    // Logs go to stderr so `--format json` stays parseable
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_incremental_run() {
        let cli = Cli::try_parse_from([
            "ruleguard", "-vv", "run", "--incremental", "--base", "main", "--workers", "3", "--no-cache",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Some(Commands::Run(args)) => {
                assert!(args.incremental);
                assert_eq!(args.base.as_deref(), Some("main"));
                assert_eq!(args.workers, Some(3));
                assert!(args.no_cache);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_worker_requires_rule() {
        assert!(Cli::try_parse_from(["ruleguard", "worker"]).is_err());
        assert!(Cli::try_parse_from(["ruleguard", "worker", "--rule", "r"]).is_ok());
    }
}
