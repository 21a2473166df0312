//! `ruleguard run`

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use super::{Workspace, change_base};
use crate::cli::{Globals, Output};
use crate::engine::{ExecutionStatus, Isolation, WorkerCommand};
use crate::orchestrator::{Report, ResultSource, RunMode, RunRequest};
use crate::rules::Severity;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Only run rules affected by changed files
    #[arg(long)]
    pub incremental: bool,

    /// Compare against this ref (implies --incremental)
    #[arg(long, value_name = "REF")]
    pub base: Option<String>,

    /// End of the compared range (defaults to the working tree)
    #[arg(long, value_name = "REF", requires = "base")]
    pub target: Option<String>,

    /// Only consider staged changes (implies --incremental)
    #[arg(long, conflicts_with = "base")]
    pub staged: bool,

    /// Upper bound on parallel workers per batch (0 = CPU count)
    #[arg(short = 'j', long)]
    pub workers: Option<usize>,

    /// Ignore cached results (fresh results are still stored)
    #[arg(long)]
    pub no_cache: bool,

    /// Run rules on threads or in worker processes
    #[arg(long, value_enum)]
    pub isolation: Option<Isolation>,

    /// Per-rule timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,

    /// Lowest failing severity that makes the exit code non-zero
    #[arg(long, value_enum, value_name = "SEVERITY")]
    pub fail_on: Option<Severity>,
}

impl RunArgs {
    fn mode(&self) -> RunMode {
        if self.incremental || self.base.is_some() || self.staged {
            RunMode::Incremental(change_base(self.base.clone(), self.target.clone(), self.staged))
        } else {
            RunMode::Full
        }
    }
}

/// Worker launch line: this binary, pointed at the same directory and config
fn worker_command(workspace: &Workspace, globals: &Globals) -> Result<WorkerCommand> {
    let mut worker = WorkerCommand::current_exe()?
        .arg("-q")
        .arg("-C")
        .arg(workspace.root.as_os_str());
    if let Some(config) = &globals.config {
        let config: PathBuf = std::fs::canonicalize(config).unwrap_or_else(|_| config.clone());
        worker = worker.arg("--config").arg(config.as_os_str());
    }
    Ok(worker)
}

pub async fn execute(args: RunArgs, globals: &Globals, output: &Output) -> Result<()> {
    let workspace = Workspace::load(globals)?;
    let engine = &workspace.engine;

    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| engine.execution.timeout());
    let isolation = args.isolation.unwrap_or(engine.execution.isolation);
    let fail_on = args.fail_on.unwrap_or(engine.fail_on);

    let mut orchestrator = workspace.orchestrator()?.with_timeout(timeout);
    if isolation == Isolation::Process {
        orchestrator = orchestrator.with_process_isolation(worker_command(&workspace, globals)?);
    }

    let request = RunRequest {
        mode: args.mode(),
        max_workers: args.workers.unwrap_or(engine.max_workers),
        use_cache: engine.use_cache && !args.no_cache,
    };
    tracing::info!(
        "Starting {} run ({} isolation, timeout {:?})",
        request.mode.name(),
        isolation,
        timeout
    );

    let report = tokio::task::spawn_blocking(move || orchestrator.run(&request))
        .await
        .context("Validation run panicked")??;

    match args.format {
        ReportFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        ReportFormat::Text => print_report(&report, fail_on, output),
    }

    let code = report.exit_code(fail_on);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn note(status: Option<ExecutionStatus>, source: ResultSource) -> &'static str {
    match (source, status) {
        (ResultSource::Cached, _) => "(cached)",
        (_, Some(ExecutionStatus::TimedOut)) => "(timed out)",
        (_, Some(ExecutionStatus::Crashed)) => "(crashed)",
        (_, Some(ExecutionStatus::Errored)) => "(error)",
        _ => "",
    }
}

fn print_report(report: &Report, fail_on: Severity, output: &Output) {
    output.header(&format!("Validation report ({} run)", report.mode));

    if let Some(reason) = &report.incremental_fallback {
        output.warning(&format!("Running the full catalog: {reason}"));
    } else if report.mode == "incremental" {
        output.info(&format!(
            "{} changed files, {} rules targeted",
            report.changed_files,
            report.total()
        ));
    }
    if let Some(reason) = &report.isolation_fallback {
        output.warning(&format!("Process isolation unavailable, used threads: {reason}"));
    }

    if report.total() == 0 {
        output.success("Nothing to validate");
        return;
    }

    output.blank_line();
    for entry in &report.entries {
        let result = &entry.result;
        output.rule_line(
            result.passed,
            result.severity,
            &result.rule_id,
            &result.message,
            note(entry.status, entry.source),
        );
        if !result.passed {
            for (key, value) in &result.evidence {
                output.verbose(&format!("    {key}: {}", value.to_json()));
            }
        }
    }

    output.section_header("Summary");
    output.summary_stats("Rules:", report.total());
    output.summary_stats("Passed:", report.passed);
    output.summary_stats("Failed:", report.failed);
    output.summary_stats("Cache hits:", report.cache_hits);
    output.summary_stats("Executed:", report.fresh_executions);
    output.summary_stats("Batches:", report.batches.len());
    if report.crashes + report.errors > 0 {
        output.summary_stats("Crashes:", report.crashes);
        output.summary_stats("Timeouts:", report.timeouts);
        output.summary_stats("Errors:", report.errors);
    }
    for batch in &report.batches {
        output.verbose(&format!(
            "batch {}: {} rules on {} workers in {:?} ({} steals)",
            batch.layer,
            batch.rules,
            batch.workers,
            batch.elapsed,
            batch.steals()
        ));
    }
    output.verbose(&format!("run {} finished in {:?}", report.run_id, report.elapsed));

    output.blank_line();
    let blocking = report.failures_at_or_above(fail_on).count();
    if blocking > 0 {
        output.error(&format!("{blocking} rules failed at or above {fail_on}"));
    } else if report.failed > 0 {
        output.warning(&format!("{} rules failed below {fail_on}", report.failed));
    } else {
        output.success("All rules passed");
    }
}
